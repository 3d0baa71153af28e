use std::fs;
use std::path::Path;

use syncstore::cluster::LocalCluster;
use syncstore::error::Error;
use syncstore::sync::{load_index, Synchronizer, INDEX_FILENAME};
use tempfile::{tempdir, TempDir};

const BLOCK_SIZE: usize = 8;
const FILE1: &str = "multi_file1.txt";
const ORIGINAL: &str = "the quick brown fox jumps over the lazy dog";

fn client(cluster: &LocalCluster, dir: &Path) -> Synchronizer {
    Synchronizer::new(cluster.services(), cluster.block_store(), dir, BLOCK_SIZE)
}

fn workdir_with(name: &str, content: &str) -> TempDir {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join(name), content).unwrap();
    dir
}

fn read(dir: &TempDir, name: &str) -> String {
    fs::read_to_string(dir.path().join(name)).unwrap()
}

async fn leader_cluster() -> LocalCluster {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();
    cluster.node(0).unwrap().heartbeat().await.unwrap();
    cluster
}

#[tokio::test]
async fn test_update_twice() {
    let cluster = leader_cluster().await;
    let dir = workdir_with(FILE1, ORIGINAL);

    let report = client(&cluster, dir.path()).sync().await.unwrap();
    assert_eq!(report.uploaded, vec![FILE1.to_string()]);
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    fs::write(dir.path().join(FILE1), "update text").unwrap();
    client(&cluster, dir.path()).sync().await.unwrap();
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    assert!(dir.path().join(INDEX_FILENAME).exists());
    let index = load_index(dir.path()).unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index[FILE1].version, 2);
    assert_eq!(read(&dir, FILE1), "update text");

    // a pass with no changes does nothing
    let report = client(&cluster, dir.path()).sync().await.unwrap();
    assert_eq!(report, Default::default());
}

#[tokio::test]
async fn test_two_clients_same_file_first_commit_wins() {
    let cluster = leader_cluster().await;
    let dir1 = workdir_with(FILE1, ORIGINAL);
    let dir2 = workdir_with(FILE1, "update text");

    client(&cluster, dir1.path()).sync().await.unwrap();
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    cluster.node(0).unwrap().crash().await;
    cluster.node(1).unwrap().assign_leader().await.unwrap();
    cluster.node(1).unwrap().heartbeat().await.unwrap();

    let report = client(&cluster, dir2.path()).sync().await.unwrap();
    assert_eq!(report.conflicts, vec![FILE1.to_string()]);
    assert_eq!(report.downloaded, vec![FILE1.to_string()]);
    cluster.node(1).unwrap().heartbeat().await.unwrap();

    client(&cluster, dir1.path()).sync().await.unwrap();

    for dir in [&dir1, &dir2] {
        let index = load_index(dir.path()).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[FILE1].version, 1);
        assert_eq!(read(dir, FILE1), ORIGINAL);
    }
}

#[tokio::test]
async fn test_two_clients_file_update_leader_failure() {
    let cluster = leader_cluster().await;
    let dir1 = workdir_with(FILE1, ORIGINAL);
    let dir2 = workdir_with(FILE1, ORIGINAL);

    client(&cluster, dir1.path()).sync().await.unwrap();
    cluster.node(0).unwrap().heartbeat().await.unwrap();
    client(&cluster, dir2.path()).sync().await.unwrap();

    cluster.node(0).unwrap().crash().await;
    cluster.node(1).unwrap().assign_leader().await.unwrap();
    cluster.node(1).unwrap().heartbeat().await.unwrap();

    fs::write(dir2.path().join(FILE1), "update text").unwrap();
    let report = client(&cluster, dir2.path()).sync().await.unwrap();
    assert_eq!(report.uploaded, vec![FILE1.to_string()]);
    cluster.node(1).unwrap().heartbeat().await.unwrap();

    let report = client(&cluster, dir1.path()).sync().await.unwrap();
    assert_eq!(report.downloaded, vec![FILE1.to_string()]);

    for dir in [&dir1, &dir2] {
        let index = load_index(dir.path()).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[FILE1].version, 2);
        assert_eq!(read(dir, FILE1), "update text");
    }
}

#[tokio::test]
async fn test_deletion_propagates() {
    let cluster = leader_cluster().await;
    let dir1 = workdir_with(FILE1, ORIGINAL);
    let dir2 = tempdir().unwrap();

    client(&cluster, dir1.path()).sync().await.unwrap();
    let report = client(&cluster, dir2.path()).sync().await.unwrap();
    assert_eq!(report.downloaded, vec![FILE1.to_string()]);
    assert_eq!(read(&dir2, FILE1), ORIGINAL);

    fs::remove_file(dir1.path().join(FILE1)).unwrap();
    let report = client(&cluster, dir1.path()).sync().await.unwrap();
    assert_eq!(report.uploaded, vec![FILE1.to_string()]);

    let report = client(&cluster, dir2.path()).sync().await.unwrap();
    assert_eq!(report.deleted, vec![FILE1.to_string()]);
    assert!(!dir2.path().join(FILE1).exists());

    let index = load_index(dir2.path()).unwrap();
    assert!(index[FILE1].tombstone);
    assert_eq!(index[FILE1].version, 2);

    let meta_map = cluster.node(0).unwrap().get_file_info_map().await.unwrap();
    assert!(meta_map[FILE1].tombstone);
}

#[tokio::test]
async fn test_recreating_deleted_file() {
    let cluster = leader_cluster().await;
    let dir = workdir_with(FILE1, ORIGINAL);

    client(&cluster, dir.path()).sync().await.unwrap();
    fs::remove_file(dir.path().join(FILE1)).unwrap();
    client(&cluster, dir.path()).sync().await.unwrap();
    fs::write(dir.path().join(FILE1), "back again").unwrap();
    client(&cluster, dir.path()).sync().await.unwrap();

    let index = load_index(dir.path()).unwrap();
    assert_eq!(index[FILE1].version, 3);
    assert!(!index[FILE1].tombstone);
}

#[tokio::test]
async fn test_fresh_client_skips_earlier_deletions() {
    let cluster = leader_cluster().await;
    let dir1 = workdir_with(FILE1, ORIGINAL);
    client(&cluster, dir1.path()).sync().await.unwrap();
    fs::remove_file(dir1.path().join(FILE1)).unwrap();
    client(&cluster, dir1.path()).sync().await.unwrap();

    let dir2 = tempdir().unwrap();
    let report = client(&cluster, dir2.path()).sync().await.unwrap();
    assert_eq!(report, Default::default());
    let index = load_index(dir2.path()).unwrap();
    assert!(index[FILE1].tombstone);
    assert_eq!(index[FILE1].version, 2);

    fs::write(dir2.path().join(FILE1), "new life").unwrap();
    let report = client(&cluster, dir2.path()).sync().await.unwrap();
    assert_eq!(report.uploaded, vec![FILE1.to_string()]);
    assert_eq!(load_index(dir2.path()).unwrap()[FILE1].version, 3);
}

#[tokio::test]
async fn test_new_file_builds_on_unseen_deletion() {
    let cluster = leader_cluster().await;
    let dir1 = workdir_with(FILE1, ORIGINAL);
    client(&cluster, dir1.path()).sync().await.unwrap();
    fs::remove_file(dir1.path().join(FILE1)).unwrap();
    client(&cluster, dir1.path()).sync().await.unwrap();

    let dir2 = workdir_with(FILE1, "written offline");
    let report = client(&cluster, dir2.path()).sync().await.unwrap();
    assert_eq!(report.uploaded, vec![FILE1.to_string()]);
    assert!(report.conflicts.is_empty());
    assert_eq!(read(&dir2, FILE1), "written offline");
    assert_eq!(load_index(dir2.path()).unwrap()[FILE1].version, 3);
}

#[tokio::test]
async fn test_sync_survives_majority_failure() {
    let cluster = leader_cluster().await;
    let dir = workdir_with(FILE1, ORIGINAL);

    cluster.node(1).unwrap().crash().await;
    cluster.node(2).unwrap().crash().await;

    let report = client(&cluster, dir.path()).sync().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, FILE1);
    assert!(load_index(dir.path()).unwrap().is_empty());
    assert!(cluster.node(0).unwrap().internal_state().await.log.is_empty());

    cluster.node(1).unwrap().restore().await;
    let report = client(&cluster, dir.path()).sync().await.unwrap();
    assert_eq!(report.uploaded, vec![FILE1.to_string()]);
    assert_eq!(load_index(dir.path()).unwrap()[FILE1].version, 1);
}

#[tokio::test]
async fn test_sync_without_leader_fails() {
    let cluster = LocalCluster::new(3).unwrap();
    let dir = workdir_with(FILE1, ORIGINAL);

    let err = client(&cluster, dir.path()).sync().await.unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
    assert!(!dir.path().join(INDEX_FILENAME).exists());
}

#[tokio::test]
async fn test_empty_and_multi_block_files() {
    let cluster = leader_cluster().await;
    let dir1 = tempdir().unwrap();
    fs::write(dir1.path().join("empty.txt"), "").unwrap();
    // repeated blocks are stored once
    fs::write(dir1.path().join("big.txt"), "abcdefgh".repeat(5) + "tail").unwrap();

    client(&cluster, dir1.path()).sync().await.unwrap();
    assert_eq!(cluster.block_store().len(), 2);

    let index = load_index(dir1.path()).unwrap();
    assert!(index["empty.txt"].block_hash_list.is_empty());
    assert_eq!(index["big.txt"].block_hash_list.len(), 6);

    let dir2 = tempdir().unwrap();
    client(&cluster, dir2.path()).sync().await.unwrap();
    assert_eq!(read(&dir2, "empty.txt"), "");
    assert_eq!(read(&dir2, "big.txt"), "abcdefgh".repeat(5) + "tail");
}
