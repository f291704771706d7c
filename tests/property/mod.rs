//! Property-based testing for backstop
//!
//! Uses proptest to check retention ordering, checksum determinism and entry
//! name safety across generated inputs.

use ::backstop::*;
use chrono::DateTime;
use proptest::prelude::*;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

/// Archive listing with `(timestamp seconds, name)` per archive
fn listing_strategy() -> impl Strategy<Value = Vec<(i64, String)>> {
    prop::collection::btree_set("[a-z]{1,8}", 0..20).prop_flat_map(|names| {
        let len = names.len();
        (
            Just(names.into_iter().collect::<Vec<_>>()),
            prop::collection::vec(0i64..50, len),
        )
            .prop_map(|(names, stamps)| stamps.into_iter().zip(names).collect())
    })
}

fn to_infos(listing: &[(i64, String)]) -> Vec<BackupInfo> {
    listing
        .iter()
        .map(|(secs, name)| BackupInfo {
            id: format!("{}.zip", name),
            path: PathBuf::from("/backups").join(format!("{}.zip", name)),
            kind: Some(BackupKind::Full),
            created_at: DateTime::from_timestamp(*secs, 0).unwrap(),
            size_bytes: 1,
            checksum: None,
            stream_count: 1,
            verification: VerificationStatus::Unchecked,
        })
        .collect()
}

/// Generate one path segment, sometimes hostile
fn segment_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z0-9_.-]{1,12}",
        Just("..".to_string()),
        Just(".".to_string()),
        Just("a:b".to_string()),
        Just("x\\y".to_string()),
    ]
}

proptest! {
    #[test]
    fn retention_evicts_exactly_the_overflow(listing in listing_strategy(), max in 1usize..8) {
        let infos = to_infos(&listing);
        let plan = RetentionPolicy::new(max).plan(&infos, &[]);
        prop_assert_eq!(plan.len(), infos.len().saturating_sub(max));
    }

    #[test]
    fn retention_keeps_the_newest(listing in listing_strategy(), max in 1usize..8) {
        let infos = to_infos(&listing);
        let plan = RetentionPolicy::new(max).plan(&infos, &[]);
        let evicted: Vec<&str> = plan.iter().map(|b| b.id.as_str()).collect();

        for kept in infos.iter().filter(|b| !evicted.contains(&b.id.as_str())) {
            for gone in &plan {
                prop_assert!(
                    (kept.created_at, &kept.id) > (gone.created_at, &gone.id),
                    "kept {} is older than evicted {}", kept.id, gone.id
                );
            }
        }
    }

    #[test]
    fn retention_never_evicts_protected(listing in listing_strategy(), max in 1usize..4, pick in any::<prop::sample::Index>()) {
        let infos = to_infos(&listing);
        prop_assume!(!infos.is_empty());
        let protected = infos[pick.index(infos.len())].path.clone();

        let plan = RetentionPolicy::new(max).plan(&infos, &[protected.clone()]);
        prop_assert!(plan.iter().all(|b| b.path != protected));
        prop_assert!(plan.len() + max >= infos.len().saturating_sub(1));
    }

    #[test]
    fn checksum_is_deterministic(data in prop::collection::vec(any::<u8>(), 0..20_000)) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob");
        fs::write(&path, &data).unwrap();

        let from_memory = utils::hash_data(&data);
        prop_assert_eq!(from_memory.len(), 64);
        prop_assert_eq!(&from_memory, &utils::hash_data(&data));
        prop_assert_eq!(&from_memory, &utils::hash_file_content(&path).unwrap());
    }

    #[test]
    fn checksum_changes_with_content(data in prop::collection::vec(any::<u8>(), 1..2_000), flip in any::<prop::sample::Index>()) {
        let mut changed = data.clone();
        let i = flip.index(changed.len());
        changed[i] ^= 0x01;
        prop_assert_ne!(utils::hash_data(&data), utils::hash_data(&changed));
    }

    #[test]
    fn safe_paths_never_escape(segments in prop::collection::vec(segment_strategy(), 1..6)) {
        let name = segments.join("/");
        if let Some(path) = utils::safe_relative_path(&name) {
            prop_assert!(path.is_relative());
            prop_assert!(path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir)));
            prop_assert!(Path::new("/root/app").join(&path).starts_with("/root/app"));
        }
    }
}
