//! Tests for the on-disk configuration store.

use super::*;
use tempfile::TempDir;

fn store_in(dir: &TempDir) -> ConfigStore {
    ConfigStore::new(dir.path().join("aicm.ini"))
}

mod parsing {
    use super::*;

    /// Well-formed INI text parses into sections and keys.
    #[test]
    fn test_parse_basic_document() {
        let doc = IniDocument::parse(
            "[tracker]\nAPI_KEY=aicm-k1-secret\nAPI_BASE=https://example.com\n\n[triggered_limits]\npayload=abc\n",
        );

        assert_eq!(doc.get("tracker", "API_KEY"), Some("aicm-k1-secret"));
        assert_eq!(doc.get("tracker", "API_BASE"), Some("https://example.com"));
        assert_eq!(doc.get("triggered_limits", "payload"), Some("abc"));
    }

    /// Duplicate sections merge with later values winning.
    #[test]
    fn test_duplicate_sections_merge_later_wins() {
        let doc = IniDocument::parse(
            "[tracker]\nTIMEOUT=5\nAPI_KEY=first\n[other]\nx=1\n[tracker]\nAPI_KEY=second\n",
        );

        assert_eq!(doc.get("tracker", "API_KEY"), Some("second"));
        assert_eq!(doc.get("tracker", "TIMEOUT"), Some("5"));
        assert_eq!(doc.get("other", "x"), Some("1"));
    }

    /// Malformed lines are dropped, the rest of the document survives.
    #[test]
    fn test_malformed_lines_dropped() {
        let doc = IniDocument::parse(
            "garbage before any section\n[tracker]\nno equals sign here\nAPI_KEY=ok\n=empty key\n",
        );

        assert_eq!(doc.get("tracker", "API_KEY"), Some("ok"));
        assert_eq!(doc.section("tracker").len(), 1);
    }

    /// Comments and blank lines are ignored.
    #[test]
    fn test_comments_ignored() {
        let doc = IniDocument::parse("# heading\n[tracker]\n; note\nAPI_KEY=k\n");
        assert_eq!(doc.get("tracker", "API_KEY"), Some("k"));
    }

    /// Values keep internal characters, trimmed at the edges.
    #[test]
    fn test_values_trimmed() {
        let doc = IniDocument::parse("[tracker]\nAPI_BASE = https://a.example.com/v1 \n");
        assert_eq!(doc.get("tracker", "API_BASE"), Some("https://a.example.com/v1"));
    }

    /// Render then parse reproduces the same document.
    #[test]
    fn test_render_round_trip() {
        let mut doc = IniDocument::new();
        doc.set("tracker", "API_KEY", "k");
        doc.set("tracker", "TIMEOUT", "2.5");
        doc.set("triggered_limits", "payload", "blob");

        let reparsed = IniDocument::parse(&doc.render());
        assert_eq!(reparsed, doc);
    }
}

mod store_io {
    use super::*;

    /// A missing file reads as an empty document.
    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(store.load().section_names().is_empty());
        assert_eq!(store.get("tracker", "API_KEY"), None);
    }

    /// set() creates the file and the value is visible to a fresh read.
    #[test]
    fn test_set_then_get() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.set("tracker", "API_KEY", "aicm-k1-s").unwrap();

        assert_eq!(store.get("tracker", "API_KEY"), Some("aicm-k1-s".to_string()));
        // No stray temp file is left behind
        assert!(!dir.path().join("aicm.ini.tmp").exists());
    }

    /// replace_section swaps the whole section wholesale.
    #[test]
    fn test_replace_section() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set("triggered_limits", "payload", "old").unwrap();
        store.set("triggered_limits", "stale_key", "x").unwrap();

        let mut mapping = std::collections::BTreeMap::new();
        mapping.insert("payload".to_string(), "new".to_string());
        mapping.insert("checksum".to_string(), "abc".to_string());
        store.replace_section("triggered_limits", mapping).unwrap();

        let section = store.get_section("triggered_limits");
        assert_eq!(section.get("payload"), Some(&"new".to_string()));
        assert_eq!(section.get("checksum"), Some(&"abc".to_string()));
        assert!(!section.contains_key("stale_key"));
    }

    /// Unknown sections written by other tools survive a rewrite.
    #[test]
    fn test_unknown_sections_pass_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aicm.ini");
        std::fs::write(&path, "[somebody_elses_tool]\nkey=value\n").unwrap();

        let store = ConfigStore::new(&path);
        store.set("tracker", "API_KEY", "k").unwrap();

        assert_eq!(
            store.get("somebody_elses_tool", "key"),
            Some("value".to_string())
        );
    }

    /// with_lock applies a read-modify-write as one unit and returns the
    /// callback's value.
    #[test]
    fn test_with_lock_read_modify_write() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set("tracker", "COUNTER", "1").unwrap();

        let previous = store
            .with_lock(|doc| {
                let previous = doc.get("tracker", "COUNTER").map(String::from);
                doc.set("tracker", "COUNTER", "2");
                previous
            })
            .unwrap();

        assert_eq!(previous, Some("1".to_string()));
        assert_eq!(store.get("tracker", "COUNTER"), Some("2".to_string()));
    }

    /// Two stores on the same path observe each other's writes.
    #[test]
    fn test_shared_path_visibility() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aicm.ini");
        let first = ConfigStore::new(&path);
        let second = ConfigStore::new(&path);

        first.set("tracker", "API_KEY", "from-first").unwrap();

        assert_eq!(second.get("tracker", "API_KEY"), Some("from-first".to_string()));
    }

    /// Concurrent writers through with_lock do not lose updates.
    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aicm.ini");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = ConfigStore::new(&path);
                    store
                        .with_lock(|doc| doc.set("tracker", &format!("KEY_{}", i), "x"))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = ConfigStore::new(&path);
        assert_eq!(store.get_section("tracker").len(), 8);
    }
}
