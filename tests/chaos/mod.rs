//! Chaos tests for Bitseal
//!
//! Damages seals and trees in ways that happen in practice, and cancels runs
//! at arbitrary points, making sure nothing is ever reported as intact that
//! is not.

use crate::fixture::*;
use ::bitseal::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tracing::info;

/// Keep the first `len` bytes of `path`
fn truncate_to(path: &Path, len: usize) {
    let mut data = fs::read(path).unwrap();
    data.truncate(len);
    fs::write(path, data).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_binary_seals_are_broken() {
        let data = Dataset::new();
        let seal = seal(data.path());
        let pristine = fs::read(&seal).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        // the trailing four bytes are the frame's end mark
        for _ in 0..8 {
            let cut = rng.random_range(0..pristine.len() - 4);
            fs::write(&seal, &pristine).unwrap();
            truncate_to(&seal, cut);
            info!(cut, "verifying truncated seal");

            let run = verify(&[seal.clone()]);
            assert!(run.result.is_err(), "cut at {} went unnoticed", cut);
            assert!(
                run.last().contains("is broken - do not trust any result of this tree"),
                "cut at {}: {}",
                cut,
                run.last()
            );
        }
    }

    #[test]
    fn test_tampered_mhl_record_breaks_seal() {
        let data = Dataset::new();
        let run = run(&EngineBuilder::new().format(Codec::Mhl).seal(&[data.path()]).unwrap());
        let seal = run.seals[0].clone();

        let xml = fs::read_to_string(&seal).unwrap();
        fs::write(&seal, xml.replace("<file>somebytes_noext</file>", "<file>somebytes_noexT</file>")).unwrap();

        let run = verify(&[seal]);
        assert!(run.result.is_err());
        // records are never handed out from a list with a bad signature
        assert_eq!(run.count("OK: "), 0);
        assert!(run.last().contains("is broken"));
    }

    #[test]
    fn test_vanished_files_are_missing() {
        let data = Dataset::new();
        let seal = seal(data.path());
        fs::remove_dir_all(data.file("subdir")).unwrap();

        let run = verify(&[seal]);
        assert!(run.result.is_err());
        assert!(run
            .last()
            .starts_with("VERIFY FAIL: 0 of 6 file(s) have changed on disk after sealing, 3 are missing"));
    }

    #[test]
    fn test_one_broken_seal_spares_other_trees() {
        let a = Dataset::new();
        let b = Dataset::new();
        let seal_a = seal(a.path());
        let seal_b = seal(b.path());
        fs::write(&seal_b, b"garbage").unwrap();

        let run = verify(&[seal_a, seal_b]);
        assert!(run.result.is_err());
        assert_eq!(run.count("VERIFY OK: "), 1);
        assert_eq!(run.results.iter().filter(|(m, _)| m.contains("is broken")).count(), 1);
    }

    #[test]
    fn test_cancel_before_start() {
        let data = Dataset::new();
        let token = CancelToken::new();
        token.cancel();

        let runner = EngineBuilder::new()
            .cancel_token(token)
            .seal(&[data.path()])
            .unwrap();
        let run = run(&runner);
        run.result.as_ref().unwrap();

        assert!(run.seals.is_empty());
        assert_eq!(run.count("# "), 0);
        assert!(run.last().starts_with("SEAL DONE: "));
        assert!(run.last().ends_with("cancelled)"));
        assert!(runner.stats().snapshot().was_cancelled);
    }

    #[test]
    fn test_cancel_midway_keeps_completed_files() {
        let data = Dataset::new();
        let runner = EngineBuilder::new().seal(&[data.path()]).unwrap();
        let token = runner.cancel_token().clone();

        let mut seals = Vec::new();
        let mut sealed = 0;
        start_engine(
            &runner,
            |_| {},
            |o| {
                if o.info().0.starts_with("# ") {
                    sealed += 1;
                    token.cancel();
                }
                if o.file_info().is_seal_marker() {
                    seals.push(o.file_info().path.clone());
                }
            },
        )
        .unwrap();

        assert!(sealed >= 1);
        assert_eq!(seals.len(), 1);
        let run = verify(&seals);
        run.result.as_ref().unwrap();
        assert_eq!(run.count("OK: "), sealed);
    }

    #[test]
    fn test_unwritable_destination_fails_cleanly() {
        let data = Dataset::new();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("not-a-dir");
        fs::write(&dest, b"occupied").unwrap();

        let runner = EngineBuilder::new().sealed_copy(&[data.path(), dest.as_path()]).unwrap();
        let run = run(&runner);
        assert!(run.result.is_err());
        assert!(run.seals.is_empty());
        assert_eq!(fs::read(&dest).unwrap(), b"occupied");
        assert!(runner.stats().snapshot().err_count >= 1);
    }

    #[test]
    fn test_random_corruption_never_verifies_clean() {
        let data = Dataset::new();
        let seal = seal(data.path());
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..6 {
            let (rela, size) = DATASET_FILES[rng.random_range(0..DATASET_FILES.len())];
            if size == 0 {
                continue;
            }
            let path = data.file(rela);
            let pristine = fs::read(&path).unwrap();
            let mut damaged = pristine.clone();
            let at = rng.random_range(0..size);
            damaged[at] = damaged[at].wrapping_add(rng.random_range(1..=255));
            fs::write(&path, &damaged).unwrap();

            let run = verify(&[seal.clone()]);
            assert!(run.result.is_err());
            assert_eq!(run.count("HASH MISMATCH: "), 1, "{} at {}", rela, at);

            fs::write(&path, &pristine).unwrap();
        }
    }
}
