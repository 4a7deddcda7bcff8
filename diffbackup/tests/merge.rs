mod common;

use common::{next_event, Harness};
use diffbackup::{BackupError, CommandSource, EngineEvent, Mode};

#[tokio::test]
async fn merge_two_to_four_into_next_tier() {
    let h = Harness::new(vec![4, 2]);
    let mut states = Vec::new();
    for (file, content) in [("a", "a1"), ("b", "b1"), ("a", "a2"), ("c", "c1")] {
        h.write(file, content);
        h.backup().await;
        states.push(h.world_contents());
    }
    // slot 1 = c1, slot 2 = a2, slot 3 = b1, slot 4 = a1
    let slot2 = h.coordinator().slot(2).await.unwrap();
    let mut events = h.coordinator().subscribe();

    let report = h
        .coordinator()
        .merge_slots(&CommandSource::Console, 2, 4, 1, Mode::Reject)
        .await
        .unwrap();
    assert_eq!(report.merged_files, 2);
    assert_eq!(report.cascaded, 0);

    let merged = h.coordinator().slot(5).await.unwrap();
    assert_eq!(merged.info.created_at, slot2.info.created_at);
    assert_eq!(merged.info.file_snapshot, slot2.info.file_snapshot);
    assert_eq!(h.included(5).await, vec!["a", "b"]);
    assert_eq!(h.coordinator().status().await.used_slots, 2);
    for id in 2..=4 {
        assert!(h.coordinator().slot(id).await.is_err());
    }
    next_event(&mut events, |e| matches!(e, EngineEvent::MergeCompleted { start: 2, end: 4, .. })).await;

    // the newest version inside the range won
    h.restore(5).await;
    assert_eq!(h.world_contents(), states[2]);
    h.restore(1).await;
    assert_eq!(h.world_contents(), states[3]);
}

#[tokio::test]
async fn merge_rejects_ranges_that_break_time_order() {
    let h = Harness::new(vec![3, 2]);
    for content in ["1", "2", "3"] {
        h.write("level.dat", content);
        h.backup().await;
    }
    let console = CommandSource::Console;

    // slot 3 would end up newer than the merged slot
    assert!(matches!(
        h.coordinator().merge_slots(&console, 1, 2, 1, Mode::Reject).await,
        Err(BackupError::InvalidSlot(_))
    ));
    assert!(matches!(
        h.coordinator().merge_slots(&console, 4, 5, 1, Mode::Reject).await,
        Err(BackupError::InvalidSlot(_))
    ));
    assert!(matches!(
        h.coordinator().merge_slots(&console, 1, 3, 2, Mode::Reject).await,
        Err(BackupError::InvalidSlot(_))
    ));
    assert_eq!(h.coordinator().status().await.used_slots, 3);
}

#[tokio::test]
async fn auto_merge_promotes_a_full_tier() {
    let h = Harness::with_config(|c| {
        c.slot_tiers = vec![2, 2];
        c.auto_merge = true;
    });
    let mut events = h.coordinator().subscribe();

    h.write("a", "a1");
    h.backup().await;
    h.write("b", "b1");
    let report = h.backup().await;

    let promotion = report.promotion.expect("tier 0 filled up");
    assert_eq!((promotion.start, promotion.end, promotion.target_tier), (1, 2, 1));
    next_event(&mut events, |e| matches!(e, EngineEvent::MergeCompleted { target_tier: 1, .. })).await;

    assert_eq!(h.coordinator().status().await.used_slots, 1);
    assert_eq!(h.included(3).await, vec!["a", "b"]);

    // the next backup diffs against the promoted slot
    h.write("c", "c1");
    let next = h.backup().await;
    assert_eq!(next.changed_files, 1);
    let state = h.world_contents();
    h.write("a", "a2");
    h.restore(1).await;
    assert_eq!(h.world_contents(), state);
}

#[tokio::test]
async fn deleting_a_slot_keeps_newer_slots_restorable() {
    let h = Harness::new(vec![5]);
    h.write("a", "a1");
    h.write("b", "b1");
    h.backup().await;
    h.write("a", "a2");
    h.backup().await;
    h.write("c", "c1");
    h.backup().await;
    let latest = h.world_contents();
    let console = CommandSource::Console;

    // slot 3 holds the only copy of b
    h.coordinator().delete_backup(&console, 3).await.unwrap();
    assert_eq!(h.coordinator().status().await.used_slots, 2);

    h.write("b", "b live");
    h.restore(1).await;
    assert_eq!(h.world_contents(), latest);

    h.coordinator().delete_backup(&console, 0).await.unwrap();
    assert!(h.coordinator().slot(0).await.is_err());
    assert!(matches!(
        h.coordinator().delete_backup(&console, 4).await,
        Err(BackupError::InvalidSlot(_))
    ));
}

#[tokio::test]
async fn reload_rebuilds_tiers_from_disk() {
    let h = Harness::new(vec![3]);
    h.write("a", "a1");
    h.backup().await;
    h.write("a", "a2");
    h.backup().await;

    let mut config = h.config.clone();
    config.slot_tiers = vec![3, 2];
    h.engine.reload(&CommandSource::Console, config).await.unwrap();

    let status = h.coordinator().status().await;
    assert_eq!(status.total_slots, 5);
    assert_eq!(status.used_slots, 2);

    let mut invalid = h.config.clone();
    invalid.slot_tiers = vec![];
    assert!(matches!(
        h.engine.reload(&CommandSource::Console, invalid).await,
        Err(BackupError::Config(_))
    ));
}
