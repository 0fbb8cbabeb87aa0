//! Integration tests for Bitseal
//!
//! Seals, copies and verifies the shared dataset end to end and checks what
//! ends up on disk as well as what gets reported.

use crate::fixture::*;
use ::bitseal::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

fn flip_bit(path: &Path, offset: usize) {
    let mut data = fs::read(path).unwrap();
    data[offset] ^= 0x01;
    fs::write(path, data).unwrap();
}

/// Regular files below `tree`, relative to it, without seals
fn relative_files(tree: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(tree)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !utils::is_seal_name(&e.file_name().to_string_lossy()))
        .map(|e| e.path().strip_prefix(tree).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}

fn seal_in(tree: &Path) -> Vec<PathBuf> {
    fs::read_dir(tree)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(utils::is_seal_name)
        })
        .collect()
}

/// Verify `seals` with logging disabled, returning the number of files read
fn run_quiet_verify(seals: &[PathBuf]) -> u32 {
    let runner = EngineBuilder::new().level(Priority::LogDisabled).verify(seals).unwrap();
    let run = run(&runner);
    run.result.as_ref().unwrap();
    assert!(run.last().starts_with("VERIFY OK: "));
    runner.stats().snapshot().total_files_read
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_seal_then_verify_clean() {
        let data = Dataset::new();
        let runner = EngineBuilder::new().seal(&[data.path()]).unwrap();
        let run = run(&runner);
        run.result.as_ref().unwrap();

        assert_eq!(run.seals.len(), 1);
        assert_eq!(run.count("# "), DATASET_FILES.len());
        assert!(run.last().starts_with("SEAL DONE: "));

        let snap = runner.stats().snapshot();
        assert_eq!(snap.total_files_read as usize, DATASET_FILES.len());
        assert_eq!(snap.bytes_read, Dataset::total_bytes());
        assert_eq!(snap.bytes_hashed, 2 * Dataset::total_bytes());
        assert_eq!(snap.err_count, 0);
        #[cfg(unix)]
        assert!(run.notices.iter().any(|(m, _)| m.starts_with("Ignoring symbolic link: ")));

        let verified = verify(&run.seals);
        verified.result.as_ref().unwrap();
        assert_eq!(verified.count("OK: "), DATASET_FILES.len());
        assert!(verified
            .last()
            .starts_with("VERIFY OK: None of 6 file(s) changed after sealing"));
    }

    #[test]
    fn test_single_bit_flip_is_one_mismatch() {
        let data = Dataset::new();
        let seal = seal(data.path());
        flip_bit(&data.file("subdir/biggie.foo"), 1024 * 1024 + 17);

        let run = verify(&[seal]);
        assert!(run.result.is_err());
        assert_eq!(run.count("HASH MISMATCH: "), 1);
        assert_eq!(run.count("OK: "), DATASET_FILES.len() - 1);
        assert!(run
            .last()
            .starts_with("VERIFY FAIL: 1 of 6 file(s) have changed on disk after sealing, 0 are missing"));
    }

    #[test]
    fn test_size_change_is_reported_distinctly() {
        let data = Dataset::new();
        let seal = seal(data.path());
        let file = data.file("somebytes_noext");
        let mut content = fs::read(&file).unwrap();
        content.truncate(100);
        fs::write(&file, content).unwrap();

        let run = verify(&[seal]);
        assert!(run.result.is_err());
        assert_eq!(run.count("HASH MISMATCH: "), 0);
        assert_eq!(run.count("Filesize of "), 1);
        assert!(run.last().starts_with("VERIFY FAIL: 1 of 6"));
    }

    #[test]
    fn test_mhl_seal_round_trip() {
        let data = Dataset::new();
        let run = run(&EngineBuilder::new().format(Codec::Mhl).seal(&[data.path()]).unwrap());
        run.result.as_ref().unwrap();
        assert_eq!(run.seals[0].extension().unwrap(), "mhl");

        let xml = fs::read_to_string(&run.seals[0]).unwrap();
        assert!(xml.contains("<file>subdir/smallie.blah</file>"));
        assert!(xml.contains("<size>123</size>"));

        let verified = verify(&run.seals);
        verified.result.as_ref().unwrap();
        assert_eq!(verified.count("OK: "), DATASET_FILES.len());
    }

    #[test]
    fn test_several_trees_get_one_seal_each() {
        let a = Dataset::new();
        let b = Dataset::new();
        let run = run(&EngineBuilder::new()
            .streams_per_input_device(3)
            .seal(&[a.path(), b.path()])
            .unwrap());
        run.result.as_ref().unwrap();
        assert_eq!(run.seals.len(), 2);
        assert_eq!(seal_in(a.path()).len(), 1);
        assert_eq!(seal_in(b.path()).len(), 1);

        let verified = verify(&run.seals);
        verified.result.as_ref().unwrap();
        assert_eq!(verified.count("VERIFY OK: "), 2);
        assert_eq!(verified.count("OK: "), 2 * DATASET_FILES.len());
    }

    #[test]
    fn test_nested_source_is_pruned() {
        let data = Dataset::new();
        let runner = EngineBuilder::new()
            .seal(&[data.path(), data.file("subdir").as_path()])
            .unwrap();
        assert_eq!(runner.trees(), &[data.path().to_path_buf()]);
    }

    #[test]
    fn test_filters_skip_entries() {
        let data = Dataset::new();
        fs::write(data.file("bitseal_2001-01-01_000000.sealz"), b"not a seal").unwrap();
        fs::write(data.file(".dotfile"), b"hidden").unwrap();

        let runner = EngineBuilder::new()
            .filters(FileFilter::parse_list("SEALS,*.blah,nothing").unwrap())
            .seal(&[data.path()])
            .unwrap();
        let run = run(&runner);
        run.result.as_ref().unwrap();

        // smallie.blah and the whole nothing/ directory are excluded
        assert_eq!(run.count("# "), DATASET_FILES.len() - 2);
        assert!(run.notices.iter().any(|(m, _)| m.starts_with("Ignoring seal file: ")));
        assert!(run.notices.iter().any(|(m, _)| m.starts_with("Ignoring hidden file: ")));
        assert!(run.notices.iter().any(|(m, _)| m.ends_with("(matched '*.blah')")));
        assert!(run.notices.iter().any(|(m, _)| m.ends_with("(matched 'nothing')")));
    }

    #[test]
    #[traced_test]
    fn test_sealed_copy_to_two_destinations() {
        let data = Dataset::new();
        let out = TempDir::new().unwrap();
        let (d1, d2) = (out.path().join("one"), out.path().join("two"));

        let runner = EngineBuilder::new()
            .streams_per_output_device(2)
            .sealed_copy(&[data.path(), Path::new("--"), d1.as_path(), d2.as_path()])
            .unwrap();
        let run = run(&runner);
        run.result.as_ref().unwrap();

        assert_eq!(run.count("CP "), 2 * DATASET_FILES.len());
        assert_eq!(run.seals.len(), 2);
        assert!(seal_in(data.path()).is_empty());
        for dest in [&d1, &d2] {
            for (rela, _) in DATASET_FILES {
                assert_eq!(fs::read(dest.join(rela)).unwrap(), fs::read(data.file(rela)).unwrap());
            }
            assert_eq!(seal_in(dest).len(), 1);
            assert!(!dest.join("symlink.ext").exists());
        }
        let snap = runner.stats().snapshot();
        assert_eq!(snap.total_files_written as usize, 2 * DATASET_FILES.len());
        assert_eq!(snap.bytes_written, 2 * Dataset::total_bytes());

        let verified = verify(&run.seals);
        verified.result.as_ref().unwrap();
        assert_eq!(verified.count("VERIFY OK: "), 2);
    }

    #[test]
    fn test_sealed_copy_without_separator() {
        let data = Dataset::new();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("copy");
        let run = run(&EngineBuilder::new().sealed_copy(&[data.path(), dest.as_path()]).unwrap());
        run.result.as_ref().unwrap();
        assert_eq!(run.seals.len(), 1);
        assert!(run.seals[0].starts_with(&dest));
    }

    #[test]
    fn test_faulty_destination_is_undone() {
        let data = Dataset::new();
        let out = TempDir::new().unwrap();
        let (good, bad) = (out.path().join("good"), out.path().join("bad"));
        fs::create_dir_all(bad.join("subdir")).unwrap();
        fs::write(bad.join("subdir/smallie.blah"), b"precious").unwrap();

        let runner = EngineBuilder::new()
            .sealed_copy(&[data.path(), Path::new("--"), good.as_path(), bad.as_path()])
            .unwrap();
        let run = run(&runner);
        assert!(run.result.is_err());

        // the good destination is complete and sealed
        assert_eq!(seal_in(&good).len(), 1);
        assert!(good.join("1mb.ext").exists());

        // the bad one lost everything this run wrote, but kept what it had
        assert!(seal_in(&bad).is_empty());
        assert_eq!(fs::read(bad.join("subdir/smallie.blah")).unwrap(), b"precious");
        assert!(!bad.join("1mb.ext").exists());
        assert!(!bad.join("nothing").exists());
        assert!(run.results.iter().any(|(m, p)| {
            m.starts_with("Did not write seal for ") && *p == Priority::Error
        }));
        assert!(run.last().starts_with("SEAL FAILED: "));

        let snap = runner.stats().snapshot();
        assert_eq!(snap.num_undone as usize, DATASET_FILES.len() - 1);
        assert_eq!(snap.err_count, 1);
    }

    #[test]
    fn test_copy_into_source_is_rejected() {
        let data = Dataset::new();
        let err = EngineBuilder::new()
            .sealed_copy(&[data.path(), Path::new("--"), data.file("subdir/inner").as_path()])
            .err()
            .unwrap();
        assert!(err.to_string().contains("into itself"));
    }

    #[test]
    fn test_level_filters_results_but_not_errors() {
        let data = Dataset::new();
        let seal = seal(data.path());
        fs::remove_file(data.file("subdir/empty.file")).unwrap();

        let run = run(&EngineBuilder::new().level(Priority::Valuable).verify(&[seal]).unwrap());
        assert!(run.result.is_err());
        assert_eq!(run.count("OK: "), 0);
        // the missing file carries an error, so it is delivered regardless
        let errors: Vec<&String> = run
            .results
            .iter()
            .filter(|(_, p)| *p == Priority::Error)
            .map(|(m, _)| m)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[1].starts_with("VERIFY FAIL: 0 of 6 file(s) have changed on disk after sealing, 1 are missing"));
    }

    #[test]
    fn test_seals_are_reported_when_nothing_is_logged() {
        let data = Dataset::new();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("copy");
        let run = run(&EngineBuilder::new()
            .level(Priority::LogDisabled)
            .sealed_copy(&[data.path(), dest.as_path()])
            .unwrap());
        run.result.as_ref().unwrap();
        assert_eq!(run.count("CP "), 0);
        assert_eq!(run.seals.len(), 1);
        assert_eq!(seal_in(&dest).len(), 1);

        let verified = run_quiet_verify(&run.seals);
        assert_eq!(verified, DATASET_FILES.len() as u32);
    }

    #[test]
    fn test_touched_files_still_verify() {
        let data = Dataset::new();
        let seal = seal(data.path());
        let past = filetime::FileTime::from_unix_time(946_684_800, 0);
        for (rela, _) in DATASET_FILES {
            filetime::set_file_mtime(data.file(rela), past).unwrap();
        }

        let run = verify(&[seal]);
        run.result.as_ref().unwrap();
        assert_eq!(run.count("OK: "), DATASET_FILES.len());
    }

    #[test]
    fn test_copy_mirrors_regular_files_only() {
        let data = Dataset::new();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("mirror");
        let run = run(&EngineBuilder::new().sealed_copy(&[data.path(), dest.as_path()]).unwrap());
        run.result.as_ref().unwrap();

        let mut expected: Vec<PathBuf> = DATASET_FILES.iter().map(|(r, _)| PathBuf::from(r)).collect();
        expected.sort();
        assert_eq!(relative_files(&dest), expected);
        assert_eq!(relative_files(data.path()), expected);
    }
}
