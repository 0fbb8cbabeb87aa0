//! Property-based testing for Bitseal
//!
//! Uses proptest to check codec and verification invariants across randomly
//! generated record sets and trees.

use ::bitseal::*;
use crossbeam_channel::unbounded;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Generate relative paths of one to four components
fn path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9_]{1,8}", 1..=4).prop_map(|parts| parts.join("/"))
}

/// Generate seal records with unique paths
fn records_strategy() -> impl Strategy<Value = Vec<FileInfo>> {
    prop::collection::btree_map(
        path_strategy(),
        (0i64..1 << 40, prop::array::uniform20(any::<u8>()), prop::array::uniform16(any::<u8>())),
        0..40,
    )
    .prop_map(|records| {
        records
            .into_iter()
            .map(|(path, (size, sha1, md5))| FileInfo {
                path: PathBuf::from(&path),
                rela_path: PathBuf::from(path),
                size,
                sha1: sha1.to_vec(),
                md5: md5.to_vec(),
                ..Default::default()
            })
            .collect()
    })
}

/// Generate file trees, mapping relative paths to contents
fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(
        "[a-z]{1,6}(/[a-z]{1,6}){0,2}",
        prop::collection::vec(any::<u8>(), 0..4096),
        1..12,
    )
    .prop_filter("no file may be another file's directory", |tree| {
        tree.keys()
            .all(|a| !tree.keys().any(|b| b.starts_with(&format!("{}/", a))))
    })
}

fn write_tree(tree: &BTreeMap<String, Vec<u8>>) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (rela, content) in tree {
        let path = dir.path().join(rela);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    dir
}

fn codec_strategy() -> impl Strategy<Value = Codec> {
    prop_oneof![Just(Codec::Binary), Just(Codec::Mhl)]
}

fn run_quietly(runner: &Runner) -> (Result<()>, Vec<String>, Vec<PathBuf>) {
    let mut lines = Vec::new();
    let mut seals = Vec::new();
    let res = start_engine(runner, |_| {}, |o| {
        if o.file_info().is_seal_marker() {
            seals.push(o.file_info().path.clone());
        }
        lines.push(o.info().0);
    });
    (res, lines, seals)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every codec reproduces the records it wrote, in order
    #[test]
    fn codec_preserves_records(records in records_strategy(), codec in codec_strategy()) {
        let mut buf = Vec::new();
        codec.serialize(records.clone(), &mut buf).unwrap();

        let (tx, rx) = unbounded();
        codec.deserialize(buf.as_slice(), &tx, |_| true).unwrap();
        drop(tx);
        let read: Vec<FileInfo> = rx.iter().collect();
        prop_assert_eq!(read, records);
    }

    /// The predicate sees every record and can stop reading at any point
    #[test]
    fn codec_stops_when_asked(records in records_strategy(), codec in codec_strategy(), stop_after in 0usize..8) {
        let mut buf = Vec::new();
        codec.serialize(records.clone(), &mut buf).unwrap();

        let (tx, rx) = unbounded();
        let mut seen = 0;
        codec.deserialize(buf.as_slice(), &tx, |_| {
            seen += 1;
            seen <= stop_after
        }).unwrap();
        drop(tx);
        prop_assert_eq!(rx.iter().count(), records.len().min(stop_after));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// An untouched tree always verifies clean, whatever its shape
    #[test]
    fn untouched_trees_verify_clean(tree in tree_strategy(), codec in codec_strategy()) {
        let dir = write_tree(&tree);
        let (res, _, seals) = run_quietly(&EngineBuilder::new().format(codec).seal(&[dir.path()]).unwrap());
        res.unwrap();
        prop_assert_eq!(seals.len(), 1);

        let (res, lines, _) = run_quietly(&EngineBuilder::new().verify(&seals).unwrap());
        res.unwrap();
        prop_assert_eq!(lines.iter().filter(|l| l.starts_with("OK: ")).count(), tree.len());
    }

    /// Changing one byte of one file yields exactly one hash mismatch
    #[test]
    fn one_changed_byte_is_one_mismatch(tree in tree_strategy(), pick in any::<prop::sample::Index>()) {
        let dir = write_tree(&tree);
        let candidates: Vec<&String> = tree.iter().filter(|(_, c)| !c.is_empty()).map(|(p, _)| p).collect();
        prop_assume!(!candidates.is_empty());

        let (res, _, seals) = run_quietly(&EngineBuilder::new().seal(&[dir.path()]).unwrap());
        res.unwrap();

        let victim = dir.path().join(pick.get(&candidates));
        let mut content = fs::read(&victim).unwrap();
        let at = pick.index(content.len());
        content[at] = !content[at];
        fs::write(&victim, content).unwrap();

        let (res, lines, _) = run_quietly(&EngineBuilder::new().verify(&seals).unwrap());
        prop_assert!(res.is_err());
        prop_assert_eq!(lines.iter().filter(|l| l.starts_with("HASH MISMATCH: ")).count(), 1);
        let summary = format!("VERIFY FAIL: 1 of {} file(s) have changed on disk after sealing", tree.len());
        prop_assert!(lines.last().unwrap().starts_with(&summary));
    }
}
