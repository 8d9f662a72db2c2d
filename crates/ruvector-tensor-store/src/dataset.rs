//! Dataset: a set of named tensors sharing one outer dimension.
//!
//! Layout inside the backing store:
//!
//! - `meta.json`: [`DatasetMeta`]
//! - `tensors/<name>/...`: one [`DynamicTensor`] per name

use crate::backend::{validate_key, BackingStore, PrefixedStore};
use crate::config::StoreConfig;
use crate::error::{Result, TensorStoreError};
use crate::meta::TensorSpec;
use crate::tensor::{DynamicTensor, Mode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Key of the dataset metadata record.
pub const DATASET_META_KEY: &str = "meta.json";

/// Current dataset metadata layout version.
pub const DATASET_META_VERSION: u32 = 1;

/// Key prefix under which tensors live.
pub const TENSORS_PREFIX: &str = "tensors";

/// Persisted dataset description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub version: u32,
    pub num_samples: usize,
    /// Tensor names, in declaration order.
    pub tensors: Vec<String>,
}

impl DatasetMeta {
    fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    fn from_json(bytes: &[u8]) -> Result<Self> {
        let meta: Self = serde_json::from_slice(bytes)?;
        if meta.version != DATASET_META_VERSION {
            return Err(TensorStoreError::SerializationError(format!(
                "unsupported dataset meta version {}",
                meta.version
            )));
        }
        Ok(meta)
    }
}

/// Receives dataset lifecycle events, e.g. to keep an external catalog in sync.
pub trait DatasetObserver: Send + Sync {
    /// A dataset was created (or recreated in write mode).
    fn on_created(&self, _meta: &DatasetMeta) {}

    /// The dataset metadata changed.
    fn on_updated(&self, _meta: &DatasetMeta) {}

    /// The dataset was deleted.
    fn on_deleted(&self) {}
}

/// Builder for creating or opening a [`Dataset`].
pub struct DatasetBuilder {
    store: Arc<dyn BackingStore>,
    num_samples: Option<usize>,
    tensors: Vec<(String, TensorSpec)>,
    mode: Mode,
    config: StoreConfig,
    observer: Option<Arc<dyn DatasetObserver>>,
}

impl DatasetBuilder {
    fn new(store: Arc<dyn BackingStore>) -> Self {
        Self {
            store,
            num_samples: None,
            tensors: Vec::new(),
            mode: Mode::default(),
            config: StoreConfig::default(),
            observer: None,
        }
    }

    /// Number of samples of a new dataset.
    pub fn num_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = Some(num_samples);
        self
    }

    /// Declare a tensor of a new dataset.
    pub fn tensor(mut self, name: impl Into<String>, spec: TensorSpec) -> Self {
        self.tensors.push((name.into(), spec));
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn DatasetObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Open or create the dataset.
    ///
    /// - [`Mode::Read`]: the dataset must exist.
    /// - [`Mode::Append`]: open an existing dataset, or create one in an
    ///   empty store.
    /// - [`Mode::Write`]: (re)create the dataset, wiping an existing one.
    ///
    /// A non-empty store that holds no dataset is never overwritten.
    pub fn build(self) -> Result<Dataset> {
        self.config.validate()?;
        let store = Arc::clone(&self.store);

        let create = if store.exists(DATASET_META_KEY)? {
            self.mode == Mode::Write
        } else {
            if self.mode == Mode::Read {
                return Err(TensorStoreError::DatasetNotFound(format!(
                    "no {DATASET_META_KEY} in {:?}",
                    store
                )));
            }
            if !store.list_keys("")?.is_empty() {
                return Err(TensorStoreError::NotADataset(format!(
                    "{:?} is not empty and holds no dataset",
                    store
                )));
            }
            true
        };

        if create {
            self.create()
        } else {
            if !self.tensors.is_empty() {
                debug!("opening existing dataset, ignoring declared tensors");
            }
            Dataset::open_existing(store, self.mode, &self.config, self.observer)
        }
    }

    fn create(self) -> Result<Dataset> {
        let num_samples = self
            .num_samples
            .ok_or(TensorStoreError::MissingArgument("num_samples"))?;
        if self.tensors.is_empty() {
            return Err(TensorStoreError::MissingArgument("tensors"));
        }
        for (i, (name, _)) in self.tensors.iter().enumerate() {
            validate_tensor_name(name)?;
            if self.tensors[..i].iter().any(|(other, _)| other == name) {
                return Err(TensorStoreError::InvalidParameter(format!(
                    "duplicate tensor name: {name}"
                )));
            }
        }

        // wipe only after the declaration is known to be usable
        self.store.delete_prefix("")?;

        let mut tensors = Vec::with_capacity(self.tensors.len());
        let created = create_contents(
            &self.store,
            num_samples,
            &self.tensors,
            &self.config,
            &mut tensors,
        );
        let meta = match created {
            Ok(meta) => meta,
            Err(e) => {
                for (_, tensor) in &tensors {
                    tensor.discard();
                }
                if let Err(cleanup) = self.store.delete_prefix("") {
                    error!(error = %cleanup, "failed to remove partially created dataset");
                }
                error!(error = %e, "dataset creation failed, removed partial storage");
                return Err(e);
            }
        };

        info!(
            num_samples,
            tensors = ?meta.tensors,
            "created dataset"
        );
        if let Some(observer) = &self.observer {
            observer.on_created(&meta);
        }
        Ok(Dataset {
            store: self.store,
            mode: Mode::Write,
            state: RwLock::new(DatasetState {
                meta,
                closed: false,
            }),
            tensors,
            observer: self.observer,
        })
    }
}

fn create_contents(
    store: &Arc<dyn BackingStore>,
    num_samples: usize,
    specs: &[(String, TensorSpec)],
    config: &StoreConfig,
    tensors: &mut Vec<(String, Arc<DynamicTensor>)>,
) -> Result<DatasetMeta> {
    for (name, spec) in specs {
        let tensor =
            DynamicTensor::create(tensor_store(store, name)?, num_samples, spec, config)?;
        tensors.push((name.clone(), Arc::new(tensor)));
    }
    let meta = DatasetMeta {
        version: DATASET_META_VERSION,
        num_samples,
        tensors: specs.iter().map(|(name, _)| name.clone()).collect(),
    };
    store.set(DATASET_META_KEY, &meta.to_json()?)?;
    Ok(meta)
}

fn tensor_store(store: &Arc<dyn BackingStore>, name: &str) -> Result<Arc<dyn BackingStore>> {
    Ok(Arc::new(PrefixedStore::new(
        Arc::clone(store),
        format!("{TENSORS_PREFIX}/{name}"),
    )?))
}

fn validate_tensor_name(name: &str) -> Result<()> {
    validate_key(name)?;
    if name.contains('/') {
        return Err(TensorStoreError::InvalidParameter(format!(
            "tensor name cannot contain '/': {name}"
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct DatasetState {
    meta: DatasetMeta,
    closed: bool,
}

/// Named tensors sharing one outer dimension, stored under one backing store.
pub struct Dataset {
    store: Arc<dyn BackingStore>,
    mode: Mode,
    state: RwLock<DatasetState>,
    tensors: Vec<(String, Arc<DynamicTensor>)>,
    observer: Option<Arc<dyn DatasetObserver>>,
}

impl Dataset {
    pub fn builder(store: Arc<dyn BackingStore>) -> DatasetBuilder {
        DatasetBuilder::new(store)
    }

    /// Open an existing dataset. Write mode, or append mode on an empty
    /// store, fails with `MissingArgument` since nothing was declared.
    pub fn open(store: Arc<dyn BackingStore>, mode: Mode) -> Result<Self> {
        Self::builder(store).mode(mode).build()
    }

    fn open_existing(
        store: Arc<dyn BackingStore>,
        mode: Mode,
        config: &StoreConfig,
        observer: Option<Arc<dyn DatasetObserver>>,
    ) -> Result<Self> {
        let meta = DatasetMeta::from_json(&store.get_required(DATASET_META_KEY)?)?;
        let mut tensors = Vec::with_capacity(meta.tensors.len());
        for name in &meta.tensors {
            let tensor = DynamicTensor::open(tensor_store(&store, name)?, mode, config)?;
            if tensor.num_samples() != meta.num_samples {
                return Err(TensorStoreError::InvalidShape(format!(
                    "tensor {} has {} samples, dataset has {}",
                    name,
                    tensor.num_samples(),
                    meta.num_samples
                )));
            }
            tensors.push((name.clone(), Arc::new(tensor)));
        }
        debug!(num_samples = meta.num_samples, %mode, "opened dataset");
        Ok(Self {
            store,
            mode,
            state: RwLock::new(DatasetState {
                meta,
                closed: false,
            }),
            tensors,
            observer,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.read().closed {
            Err(TensorStoreError::Closed("dataset".into()))
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(TensorStoreError::ReadOnly("dataset opened in read mode".into()))
        }
    }

    /// Tensor called `name`.
    pub fn tensor(&self, name: &str) -> Result<Arc<DynamicTensor>> {
        self.ensure_open()?;
        self.tensors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| Arc::clone(t))
            .ok_or_else(|| TensorStoreError::TensorNotFound(name.to_string()))
    }

    pub fn tensor_names(&self) -> Vec<String> {
        self.tensors.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn num_samples(&self) -> usize {
        self.state.read().meta.num_samples
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn meta(&self) -> DatasetMeta {
        self.state.read().meta.clone()
    }

    /// Resize every tensor to `num_samples` samples. No-op when unchanged.
    ///
    /// Either every tensor and the dataset metadata take the new count, or,
    /// on error, tensors already resized are reverted to the previous one.
    pub fn resize_shape(&self, num_samples: usize) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        let mut state = self.state.write();
        if state.meta.num_samples == num_samples {
            return Ok(());
        }

        let mut resized = Vec::with_capacity(self.tensors.len());
        let mut failure = None;
        for (name, tensor) in &self.tensors {
            match tensor.begin_resize(num_samples) {
                Ok(undo) => resized.push((name, tensor, undo)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            let mut meta = state.meta.clone();
            meta.num_samples = num_samples;
            match meta
                .to_json()
                .and_then(|bytes| self.store.set(DATASET_META_KEY, &bytes))
            {
                Ok(()) => state.meta = meta,
                Err(e) => failure = Some(e),
            }
        }
        if let Some(e) = failure {
            for (name, tensor, undo) in resized.into_iter().rev() {
                if let Some(undo) = undo {
                    if let Err(revert) = tensor.undo_resize(undo) {
                        error!(tensor = %name, error = %revert, "failed to revert tensor resize");
                    }
                }
            }
            error!(error = %e, num_samples, "dataset resize failed, kept previous sample count");
            return Err(e);
        }

        for (_, tensor, undo) in &resized {
            if let Some(undo) = undo {
                tensor.finish_resize(undo)?;
            }
        }
        info!(num_samples, "resized dataset");
        if let Some(observer) = &self.observer {
            observer.on_updated(&state.meta);
        }
        Ok(())
    }

    /// Grow the outer dimension by `count` samples.
    pub fn append_shape(&self, count: usize) -> Result<()> {
        let current = self.num_samples();
        self.resize_shape(current + count)
    }

    /// Persist all pending writes of every tensor.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        for (_, tensor) in &self.tensors {
            tensor.flush()?;
        }
        Ok(())
    }

    /// Close every tensor. The first error is returned after all were tried.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(TensorStoreError::Closed("dataset".into()));
        }
        let mut first_err = None;
        for (name, tensor) in &self.tensors {
            if let Err(e) = tensor.close() {
                error!(tensor = %name, error = %e, "failed to close tensor");
                first_err.get_or_insert(e);
            }
        }
        state.closed = true;
        first_err.map_or(Ok(()), Err)
    }

    /// Remove the dataset and all its tensors from the backing store.
    pub fn delete(self) -> Result<()> {
        self.ensure_writable()?;
        for (_, tensor) in &self.tensors {
            tensor.discard();
        }
        let removed = self.store.delete_prefix("")?;
        self.state.write().closed = true;
        info!(keys = removed, "deleted dataset");
        if let Some(observer) = &self.observer {
            observer.on_deleted();
        }
        Ok(())
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("store", &self.store)
            .field("mode", &self.mode)
            .field("meta", &self.state.read().meta)
            .field("tensors", &self.tensor_names())
            .finish()
    }
}
