//! Main test module for Bitseal
//!
//! This module includes all test suites:
//! - Integration tests for seal, sealed copy and verify scenarios
//! - Chaos tests for corrupted seals, vanishing files and cancellation
//! - Property-based tests for codec and verification invariants

pub mod chaos;
pub mod integration;
pub mod property;

/// Shared fixtures
pub mod fixture {
    use ::bitseal::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Regular files in [`Dataset`], by path relative to its root
    pub const DATASET_FILES: [(&str, usize); 6] = [
        ("1mb.ext", 1024 * 1024),
        ("somebytes_noext", 313),
        ("subdir/biggie.foo", 1024 * 1024 + 5123),
        ("subdir/smallie.blah", 123),
        ("subdir/empty.file", 0),
        ("nothing/stillnothing/ünicod€/somefile.ext", 12345),
    ];

    /// A tree with a few files of well known sizes
    pub struct Dataset {
        pub dir: TempDir,
    }

    impl Dataset {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut rng = StdRng::seed_from_u64(0xb175ea1);
            for (rela, size) in DATASET_FILES {
                let path = dir.path().join(rela);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                let data: Vec<u8> = (0..size).map(|_| rng.random()).collect();
                fs::write(&path, data).unwrap();
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink("1mb.ext", dir.path().join("symlink.ext")).unwrap();
            Self { dir }
        }

        pub fn path(&self) -> &Path {
            self.dir.path()
        }

        pub fn file(&self, rela: &str) -> PathBuf {
            self.dir.path().join(rela)
        }

        pub fn total_bytes() -> u64 {
            DATASET_FILES.iter().map(|(_, size)| *size as u64).sum()
        }
    }

    /// Everything a run reported
    pub struct Run {
        pub result: Result<()>,
        pub notices: Vec<(String, Priority)>,
        pub results: Vec<(String, Priority)>,
        pub seals: Vec<PathBuf>,
    }

    impl Run {
        pub fn count(&self, prefix: &str) -> usize {
            self.results.iter().filter(|(m, _)| m.starts_with(prefix)).count()
        }

        pub fn last(&self) -> &str {
            self.results.last().map(|(m, _)| m.as_str()).unwrap_or_default()
        }
    }

    pub fn run(runner: &Runner) -> Run {
        let mut notices = Vec::new();
        let mut results = Vec::new();
        let mut seals = Vec::new();
        let result = start_engine(
            runner,
            |o| notices.push(o.info()),
            |o| {
                if o.file_info().is_seal_marker() {
                    seals.push(o.file_info().path.clone());
                }
                results.push(o.info());
            },
        );
        Run {
            result,
            notices,
            results,
            seals,
        }
    }

    pub fn seal(tree: &Path) -> PathBuf {
        let run = run(&EngineBuilder::new().seal(&[tree]).unwrap());
        run.result.as_ref().unwrap();
        assert_eq!(run.seals.len(), 1);
        run.seals[0].clone()
    }

    pub fn verify(seals: &[PathBuf]) -> Run {
        run(&EngineBuilder::new().verify(seals).unwrap())
    }
}

#[cfg(test)]
mod edge_cases {
    use super::fixture::*;
    use ::bitseal::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        let seal = seal(dir.path());

        let run = verify(&[seal]);
        run.result.as_ref().unwrap();
        assert!(run.last().starts_with("VERIFY OK: None of 0 file(s) changed after sealing"));
    }

    #[test]
    fn test_special_filenames() {
        let dir = TempDir::new().unwrap();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "файл.txt",
            "文件.txt",
            "🚀🌟💾.txt",
        ];
        let mut created = 0;
        for name in &names {
            if fs::write(dir.path().join(name), format!("Content of {}", name)).is_ok() {
                created += 1;
            }
        }

        let seal = seal(dir.path());
        let run = verify(&[seal]);
        run.result.as_ref().unwrap();
        assert_eq!(run.count("OK: "), created);
    }

    #[test]
    fn test_deep_nesting() {
        let dir = TempDir::new().unwrap();
        let mut path = dir.path().to_path_buf();
        for i in 0..24 {
            path = path.join(format!("level{}", i));
        }
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("deep.txt"), b"deep").unwrap();

        let seal = seal(dir.path());
        let run = verify(&[seal]);
        run.result.as_ref().unwrap();
        assert_eq!(run.count("OK: "), 1);
    }

    #[test]
    fn test_seal_needs_existing_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();

        assert!(EngineBuilder::new().seal(&[dir.path().join("missing")]).is_err());
        assert!(EngineBuilder::new().seal(&[&file]).is_err());
        assert!(EngineBuilder::new().verify(&[&file]).is_err());
    }
}
