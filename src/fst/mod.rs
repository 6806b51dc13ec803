//! Minimized FSA/FST graphs on disk: the term dictionary as a DAG, with
//! optional values accumulated along arcs. The writer builds the graph
//! incrementally from sorted keys (Daciuk-Mihov with value pushing); the
//! reader walks it through an arc cursor, supports per-node binary search
//! when arcs are fixed-size, and powers fuzzy enumeration.
//!
//! File layout: `"GRPH"` magic, `u32` version, `u64` trailer offset
//! (patched at close), serialized nodes bottom-up, then a JSON trailer
//! mapping field names to root addresses.

pub mod reader;
pub mod values;
pub mod writer;

pub use reader::{Cursor, FstArc, GraphReader, Within};
pub use values::{BytesValues, IntListValues, IntValues, NoValues, Values};
pub use writer::GraphWriter;

pub const GRAPH_MAGIC: &[u8; 4] = b"GRPH";
pub const GRAPH_VERSION: u32 = 1;

// Arc flag bits.
pub(crate) const ARC_LAST: u8 = 1;
pub(crate) const ARC_ACCEPT: u8 = 2;
pub(crate) const ARC_STOP: u8 = 4;
pub(crate) const ARC_HAS_VAL: u8 = 8;
pub(crate) const ARC_HAS_ACCEPT_VAL: u8 = 16;
pub(crate) const MULTIBYTE_LABEL: u8 = 32;

/// Pseudo-arc introducing a run of equally sized arcs; records their
/// common size and count so readers can binary search.
pub(crate) const FIXED_SIZE: u8 = 0xFF;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use tempfile::TempDir;

    fn build<'a, I>(path: &std::path::Path, field: &str, keys: I)
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut writer: GraphWriter<NoValues> = GraphWriter::create(path).unwrap();
        writer.start_field(field).unwrap();
        for key in keys {
            writer.insert(key, None).unwrap();
        }
        writer.finish_field().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn dawg_build_and_enumerate() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("terms.grf");
        build(
            &path,
            "body",
            vec![b"bat".as_ref(), b"bath".as_ref(), b"cat".as_ref()],
        );

        let graph: GraphReader<NoValues> = GraphReader::open(&path).unwrap();
        let root = graph.root("body").unwrap();
        let mut cursor = Cursor::new(&graph, root).unwrap();
        let found: Vec<Vec<u8>> = cursor.flatten().unwrap();
        assert_eq!(
            vec![b"bat".to_vec(), b"bath".to_vec(), b"cat".to_vec()],
            found
        );
    }

    #[test]
    fn minimized_tails_share_nodes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("share.grf");
        build(&path, "body", vec![b"bat".as_ref(), b"cat".as_ref()]);

        let graph: GraphReader<NoValues> = GraphReader::open(&path).unwrap();
        let root = graph.root("body").unwrap();
        // The "at" tails converge: both first arcs lead to the same address.
        let b_arc = graph.find_arc(root, b"b").unwrap().unwrap();
        let c_arc = graph.find_arc(root, b"c").unwrap().unwrap();
        assert_ne!(b_arc.target, None);
        assert_eq!(b_arc.target, c_arc.target);
    }

    #[test]
    fn find_path_and_accept() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("paths.grf");
        build(
            &path,
            "body",
            vec![b"bat".as_ref(), b"bath".as_ref(), b"cat".as_ref()],
        );
        let graph: GraphReader<NoValues> = GraphReader::open(&path).unwrap();
        let root = graph.root("body").unwrap();

        let arc = graph.find_path(root, b"bat").unwrap().unwrap();
        assert!(arc.accept);
        let arc = graph.find_path(root, b"bath").unwrap().unwrap();
        assert!(arc.accept);
        assert!(graph.find_path(root, b"ba").unwrap().unwrap().accept == false);
        assert!(graph.find_path(root, b"dog").unwrap().is_none());
    }

    #[test]
    fn multiple_fields_have_independent_roots() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fields.grf");
        {
            let mut writer: GraphWriter<NoValues> = GraphWriter::create(&path).unwrap();
            writer.start_field("title").unwrap();
            writer.insert(b"alfalfa", None).unwrap();
            writer.insert(b"apple", None).unwrap();
            writer.finish_field().unwrap();
            writer.start_field("body").unwrap();
            writer.insert(b"artichoke", None).unwrap();
            writer.finish_field().unwrap();
            writer.close().unwrap();
        }
        let graph: GraphReader<NoValues> = GraphReader::open(&path).unwrap();
        assert!(graph.has_root("title"));
        assert!(graph.has_root("body"));
        assert!(!graph.has_root("tags"));

        let mut cursor = Cursor::new(&graph, graph.root("title").unwrap()).unwrap();
        assert_eq!(
            vec![b"alfalfa".to_vec(), b"apple".to_vec()],
            cursor.flatten().unwrap()
        );
    }

    #[test]
    fn fst_values_accumulate_along_paths() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vals.grf");
        let keys: Vec<(&[u8], u64)> = vec![
            (b"bat", 11),
            (b"bath", 12),
            (b"cab", 5),
            (b"cat", 100),
        ];
        {
            let mut writer: GraphWriter<IntValues> = GraphWriter::create(&path).unwrap();
            writer.start_field("body").unwrap();
            for (key, v) in &keys {
                writer.insert(key, Some(*v)).unwrap();
            }
            writer.finish_field().unwrap();
            writer.close().unwrap();
        }
        let graph: GraphReader<IntValues> = GraphReader::open(&path).unwrap();
        let root = graph.root("body").unwrap();
        let mut cursor = Cursor::new(&graph, root).unwrap();
        let found = cursor.flatten_v().unwrap();
        let expected: Vec<(Vec<u8>, Option<u64>)> = keys
            .iter()
            .map(|(k, v)| (k.to_vec(), Some(*v)))
            .collect();
        assert_eq!(expected, found);
    }

    #[test]
    fn bytes_values_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bvals.grf");
        let keys: Vec<(&[u8], &[u8])> = vec![
            (b"deep", b"submarine"),
            (b"deeper", b"subsoil"),
            (b"dog", b"canine"),
        ];
        {
            let mut writer: GraphWriter<BytesValues> = GraphWriter::create(&path).unwrap();
            writer.start_field("body").unwrap();
            for (key, v) in &keys {
                writer.insert(key, Some(v.to_vec())).unwrap();
            }
            writer.finish_field().unwrap();
            writer.close().unwrap();
        }
        let graph: GraphReader<BytesValues> = GraphReader::open(&path).unwrap();
        let mut cursor = Cursor::new(&graph, graph.root("body").unwrap()).unwrap();
        let found = cursor.flatten_v().unwrap();
        let expected: Vec<(Vec<u8>, Option<Vec<u8>>)> = keys
            .iter()
            .map(|(k, v)| (k.to_vec(), Some(v.to_vec())))
            .collect();
        assert_eq!(expected, found);
    }

    #[test]
    fn writer_rejects_disorder_and_empty_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("order.grf");
        let mut writer: GraphWriter<NoValues> = GraphWriter::create(&path).unwrap();
        writer.start_field("body").unwrap();
        writer.insert(b"m", None).unwrap();
        match writer.insert(b"a", None) {
            Err(Error::OrderViolation(_)) => {}
            other => panic!("expected OrderViolation, got {:?}", other),
        }
        match writer.insert(b"", None) {
            Err(Error::InvalidValue(_)) => {}
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn cursor_skip_to_positions_at_next_key() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("skip.grf");
        build(
            &path,
            "body",
            vec![
                b"bat".as_ref(),
                b"bath".as_ref(),
                b"cat".as_ref(),
                b"dog".as_ref(),
            ],
        );
        let graph: GraphReader<NoValues> = GraphReader::open(&path).unwrap();
        let root = graph.root("body").unwrap();

        let mut cursor = Cursor::new(&graph, root).unwrap();
        cursor.skip_to(b"bath").unwrap();
        assert_eq!(
            vec![b"bath".to_vec(), b"cat".to_vec(), b"dog".to_vec()],
            cursor.flatten().unwrap()
        );

        let mut cursor = Cursor::new(&graph, root).unwrap();
        cursor.skip_to(b"bb").unwrap();
        assert_eq!(
            vec![b"cat".to_vec(), b"dog".to_vec()],
            cursor.flatten().unwrap()
        );

        let mut cursor = Cursor::new(&graph, root).unwrap();
        cursor.skip_to(b"dzz").unwrap();
        assert!(!cursor.is_active());
    }

    #[test]
    fn within_distance_one() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("within.grf");
        build(
            &path,
            "body",
            vec![
                b"car".as_ref(),
                b"cart".as_ref(),
                b"cat".as_ref(),
                b"dog".as_ref(),
            ],
        );
        let graph: GraphReader<NoValues> = GraphReader::open(&path).unwrap();
        let root = graph.root("body").unwrap();
        let mut within = Within::new(&graph, root, b"cat", 1, 0).unwrap();
        let mut found = Vec::new();
        while let Some(key) = within.next_match().unwrap() {
            found.push(key);
        }
        found.sort();
        assert_eq!(
            vec![b"car".to_vec(), b"cart".to_vec(), b"cat".to_vec()],
            found
        );
    }

    #[test]
    fn within_transposition_counts_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("transpose.grf");
        build(&path, "body", vec![b"acb".as_ref()]);
        let graph: GraphReader<NoValues> = GraphReader::open(&path).unwrap();
        let root = graph.root("body").unwrap();
        let mut within = Within::new(&graph, root, b"abc", 1, 0).unwrap();
        assert_eq!(Some(b"acb".to_vec()), within.next_match().unwrap());
    }

    #[test]
    fn within_respects_prefix() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prefix.grf");
        build(&path, "body", vec![b"bat".as_ref(), b"cat".as_ref()]);
        let graph: GraphReader<NoValues> = GraphReader::open(&path).unwrap();
        let root = graph.root("body").unwrap();
        // With a pinned first byte, "bat" is no longer within reach of "cat".
        let mut within = Within::new(&graph, root, b"cat", 1, 1).unwrap();
        let mut found = Vec::new();
        while let Some(key) = within.next_match().unwrap() {
            found.push(key);
        }
        assert_eq!(vec![b"cat".to_vec()], found);
    }
}
