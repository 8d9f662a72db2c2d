//! Dataset lifecycle tests against persistent backends.

use ndarray::{arr1, arr2, Array2};
use ruvector_tensor_store::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;

fn declare(store: Arc<dyn BackingStore>) -> ruvector_tensor_store::DatasetBuilder {
    Dataset::builder(store)
        .num_samples(10)
        .tensor(
            "image",
            TensorSpec::dynamic(&[None, None], &[100, 100], DType::U8).with_chunks(&[2, 32, 32]),
        )
        .tensor(
            "label",
            TensorSpec::new(&[], DType::I32).with_compressor("zstd".parse().unwrap()),
        )
}

#[test]
fn test_reopen_filesystem_dataset() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn BackingStore> = Arc::new(FsStore::new(dir.path()).unwrap());

    {
        let ds = declare(Arc::clone(&store)).mode(Mode::Write).build().unwrap();
        let image = ds.tensor("image").unwrap();
        image.fill(&sel![0, 0..10, 0..10], 1u8).unwrap();
        image.fill(&sel![0, 10..20, 10..20], 5u8).unwrap();
        ds.tensor("label").unwrap().write(&sel![0..3], &arr1(&[7, 8, 9])).unwrap();
        ds.close().unwrap();
    }
    assert!(dir.path().join("meta.json").is_file());
    assert!(dir.path().join("tensors/image/--dynamic--/shape_table").is_file());

    let ds = Dataset::open(Arc::clone(&store), Mode::Read).unwrap();
    assert_eq!(ds.num_samples(), 10);
    assert_eq!(ds.tensor_names(), vec!["image", "label"]);

    let image = ds.tensor("image").unwrap();
    assert_eq!(image.sample_shape(0).unwrap(), vec![20, 20]);
    assert!(image
        .read::<u8>(&sel![0, 0..10, 0..10])
        .unwrap()
        .iter()
        .all(|&v| v == 1));
    assert_eq!(
        ds.tensor("label").unwrap().read::<i32>(&sel![0..4]).unwrap(),
        arr1(&[7, 8, 9, 0]).into_dyn()
    );
}

#[test]
fn test_append_mode_resizes_and_keeps_data() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn BackingStore> = Arc::new(FsStore::new(dir.path()).unwrap());

    {
        let ds = declare(Arc::clone(&store)).build().unwrap();
        ds.tensor("image").unwrap().write(&sel![9], &arr2(&[[1u8, 2], [3, 4]])).unwrap();
        ds.flush().unwrap();
    }

    let ds = Dataset::open(Arc::clone(&store), Mode::Append).unwrap();
    ds.append_shape(5).unwrap();
    assert_eq!(ds.num_samples(), 15);
    let image = ds.tensor("image").unwrap();
    assert_eq!(image.num_samples(), 15);
    image.write(&sel![14], &Array2::from_elem((1, 3), 6u8)).unwrap();
    assert_eq!(image.read::<u8>(&sel![9]).unwrap(), arr2(&[[1u8, 2], [3, 4]]).into_dyn());
    ds.close().unwrap();

    let ds = Dataset::open(store, Mode::Read).unwrap();
    assert_eq!(ds.meta().num_samples, 15);
    assert_eq!(ds.tensor("image").unwrap().sample_shape(14).unwrap(), vec![1, 3]);
}

#[test]
fn test_write_mode_recreates() {
    let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
    {
        let ds = declare(Arc::clone(&store)).build().unwrap();
        ds.tensor("label").unwrap().fill(&sel![..], 3i32).unwrap();
        ds.close().unwrap();
    }

    let ds = Dataset::builder(Arc::clone(&store))
        .num_samples(2)
        .tensor("score", TensorSpec::new(&[], DType::F32))
        .mode(Mode::Write)
        .build()
        .unwrap();
    assert_eq!(ds.tensor_names(), vec!["score"]);
    assert!(!store.exists("tensors/label/meta.json").unwrap());

    // write mode without a declaration never wipes the existing dataset
    assert!(matches!(
        Dataset::open(Arc::clone(&store), Mode::Write),
        Err(TensorStoreError::MissingArgument(_))
    ));
    assert!(store.exists("tensors/score/meta.json").unwrap());
}

#[test]
fn test_refuses_foreign_store() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"not a dataset").unwrap();
    let store: Arc<dyn BackingStore> = Arc::new(FsStore::new(dir.path()).unwrap());

    for mode in [Mode::Write, Mode::Append] {
        assert!(matches!(
            declare(Arc::clone(&store)).mode(mode).build(),
            Err(TensorStoreError::NotADataset(_))
        ));
    }
    assert!(matches!(
        declare(Arc::clone(&store)).mode(Mode::Read).build(),
        Err(TensorStoreError::DatasetNotFound(_))
    ));
    assert!(dir.path().join("notes.txt").is_file());
}

#[test]
fn test_delete_removes_all_keys() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn BackingStore> = Arc::new(FsStore::new(dir.path()).unwrap());
    let ds = declare(Arc::clone(&store)).build().unwrap();
    ds.tensor("image").unwrap().fill(&sel![0, 0..4, 0..4], 1u8).unwrap();
    ds.flush().unwrap();
    assert!(!store.list_keys("tensors/image/chunks/").unwrap().is_empty());

    ds.delete().unwrap();
    assert!(store.list_keys("").unwrap().is_empty());
}

#[test]
fn test_wrong_compressor_name() {
    let err = "brotli".parse::<Compressor>().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unsupported operation: Wrong compressor: brotli, only LZ4 and ZSTD are supported"
    );
    assert_eq!("default".parse::<Compressor>().unwrap(), Compressor::Lz4);
}

#[cfg(feature = "storage")]
#[test]
fn test_redb_backed_dataset() {
    use ruvector_tensor_store::RedbStore;

    let dir = tempdir().unwrap();
    let path = dir.path().join("dataset.redb");
    {
        let store: Arc<dyn BackingStore> = Arc::new(RedbStore::new(&path).unwrap());
        let ds = declare(store).build().unwrap();
        ds.tensor("label").unwrap().write(&sel![4], &ndarray::arr0(44)).unwrap();
        ds.close().unwrap();
    }

    let store: Arc<dyn BackingStore> = Arc::new(RedbStore::new(&path).unwrap());
    let ds = Dataset::open(store, Mode::Read).unwrap();
    assert_eq!(
        ds.tensor("label").unwrap().read::<i32>(&sel![3..5]).unwrap(),
        arr1(&[0, 44]).into_dyn()
    );
}
