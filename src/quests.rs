//! The quest index.
//!
//! Quests live in a directory tree: `<root>/<category>/<quest-name>/` with
//! per-version `<tag>.bin` / `<tag>.dat` pairs and an optional
//! `metadata.json`. The whole tree loads at startup and on reload; lookups
//! apply per-version substitution so e.g. an Episode III client can run the
//! GC variant of a quest.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use ragol_proto::Version;

/// The binary + map file pair transmitted to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestFiles {
    pub bin: Vec<u8>,
    pub dat: Vec<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct QuestMetadata {
    #[serde(rename = "QuestID", default)]
    quest_id: u32,
    #[serde(rename = "Joinable", default)]
    joinable: bool,
    #[serde(rename = "Description", default)]
    description: String,
}

/// One quest, with files for every version it ships for.
#[derive(Debug)]
pub struct Quest {
    pub name: String,
    pub category: String,
    pub quest_id: u32,
    /// Whether clients may join mid-quest.
    pub joinable: bool,
    pub description: String,
    files: HashMap<String, QuestFiles>,
}

impl Quest {
    /// Version substitution chain: exact tag first, then compatible
    /// fallbacks (Episode III and the GC trial run GC quests; trial DC
    /// runs v1 quests).
    fn substitution_tags(version: Version) -> &'static [&'static str] {
        match version {
            Version::GcEp3 | Version::GcEp3Nte => &["gc-ep3", "gc-v3"],
            Version::GcNte => &["gc-nte", "gc-v3"],
            Version::DcNte => &["dc-nte", "dc-v1"],
            Version::PcNte => &["pc-nte", "pc-v2"],
            Version::XbV3 => &["xb-v3", "gc-v3"],
            v => match v {
                Version::DcV1 => &["dc-v1"],
                Version::DcV2 => &["dc-v2", "dc-v1"],
                Version::PcV2 => &["pc-v2"],
                Version::GcV3 => &["gc-v3"],
                Version::BbV4 => &["bb-v4"],
                _ => &[],
            },
        }
    }

    /// The files a given client version should receive.
    pub fn files_for(&self, version: Version) -> Option<&QuestFiles> {
        Self::substitution_tags(version)
            .iter()
            .find_map(|tag| self.files.get(*tag))
    }

    pub fn available_versions(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }
}

/// All quests, grouped by category.
#[derive(Debug, Default)]
pub struct QuestIndex {
    categories: BTreeMap<String, Vec<Arc<Quest>>>,
    count: usize,
}

impl QuestIndex {
    /// Load the tree under `root`. A missing root is an empty index.
    pub fn load(root: &Path) -> QuestIndex {
        let mut index = QuestIndex::default();
        let Ok(categories) = std::fs::read_dir(root) else {
            return index;
        };
        for category_entry in categories.flatten() {
            let category_path = category_entry.path();
            if !category_path.is_dir() {
                continue;
            }
            let category = category_entry.file_name().to_string_lossy().into_owned();
            let Ok(quest_dirs) = std::fs::read_dir(&category_path) else {
                continue;
            };
            for quest_entry in quest_dirs.flatten() {
                let quest_path = quest_entry.path();
                if !quest_path.is_dir() {
                    continue;
                }
                let name = quest_entry.file_name().to_string_lossy().into_owned();
                match Self::load_quest(&quest_path, &category, &name) {
                    Some(quest) => {
                        index.count += 1;
                        index
                            .categories
                            .entry(category.clone())
                            .or_default()
                            .push(Arc::new(quest));
                    }
                    None => {
                        warn!(quest = %name, "Quest directory has no usable files");
                    }
                }
            }
        }
        for quests in index.categories.values_mut() {
            quests.sort_by(|a, b| a.quest_id.cmp(&b.quest_id).then(a.name.cmp(&b.name)));
        }
        info!(count = index.count, "Loaded quest index");
        index
    }

    fn load_quest(dir: &Path, category: &str, name: &str) -> Option<Quest> {
        let metadata: QuestMetadata = std::fs::read_to_string(dir.join("metadata.json"))
            .ok()
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();

        let mut files = HashMap::new();
        let entries = std::fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "bin") {
                continue;
            }
            let Some(tag) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if Version::from_tag(&tag).is_none() {
                continue;
            }
            let dat_path = path.with_extension("dat");
            let (Ok(bin), Ok(dat)) = (std::fs::read(&path), std::fs::read(&dat_path)) else {
                warn!(quest = name, version = %tag, "Missing .bin/.dat pair");
                continue;
            };
            files.insert(tag, QuestFiles { bin, dat });
        }
        if files.is_empty() {
            return None;
        }
        Some(Quest {
            name: name.to_string(),
            category: category.to_string(),
            quest_id: metadata.quest_id,
            joinable: metadata.joinable,
            description: metadata.description,
            files,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn quests_in(&self, category: &str) -> &[Arc<Quest>] {
        self.categories
            .get(category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn find(&self, name: &str) -> Option<Arc<Quest>> {
        self.categories
            .values()
            .flatten()
            .find(|q| q.name == name)
            .cloned()
    }

    /// Every quest a version can actually run.
    pub fn available_for(&self, version: Version) -> Vec<Arc<Quest>> {
        self.categories
            .values()
            .flatten()
            .filter(|q| q.files_for(version).is_some())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_quest(root: &Path, category: &str, name: &str, tags: &[&str], meta: Option<&str>) {
        let dir = root.join(category).join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for tag in tags {
            std::fs::write(dir.join(format!("{tag}.bin")), b"binary").unwrap();
            std::fs::write(dir.join(format!("{tag}.dat")), b"mapdata").unwrap();
        }
        if let Some(meta) = meta {
            std::fs::write(dir.join("metadata.json"), meta).unwrap();
        }
    }

    #[test]
    fn loads_tree_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_quest(
            dir.path(),
            "retrieval",
            "lost-heat-sword",
            &["gc-v3", "bb-v4"],
            Some(r#"{"QuestID": 101, "Joinable": true, "Description": "Find it"}"#),
        );
        write_quest(dir.path(), "extermination", "battle-training", &["dc-v1"], None);

        let index = QuestIndex::load(dir.path());
        assert_eq!(index.count(), 2);
        let quest = index.find("lost-heat-sword").unwrap();
        assert_eq!(quest.quest_id, 101);
        assert!(quest.joinable);
        assert_eq!(index.quests_in("retrieval").len(), 1);
        assert!(index.quests_in("nonexistent").is_empty());
    }

    #[test]
    fn version_substitution() {
        let dir = tempfile::tempdir().unwrap();
        write_quest(dir.path(), "retrieval", "gc-only", &["gc-v3"], None);
        let index = QuestIndex::load(dir.path());
        let quest = index.find("gc-only").unwrap();
        // Episode III and Xbox fall back to the GC files.
        assert!(quest.files_for(Version::GcEp3).is_some());
        assert!(quest.files_for(Version::XbV3).is_some());
        assert!(quest.files_for(Version::BbV4).is_none());
        assert_eq!(index.available_for(Version::BbV4).len(), 0);
        assert_eq!(index.available_for(Version::GcEp3).len(), 1);
    }

    #[test]
    fn missing_root_is_empty() {
        let index = QuestIndex::load(Path::new("/nonexistent/quests"));
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn incomplete_pair_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let quest_dir = dir.path().join("cat").join("broken");
        std::fs::create_dir_all(&quest_dir).unwrap();
        std::fs::write(quest_dir.join("gc-v3.bin"), b"binary").unwrap();
        // No .dat file.
        let index = QuestIndex::load(dir.path());
        assert_eq!(index.count(), 0);
    }
}
