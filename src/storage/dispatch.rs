use std::{fmt, sync::Arc};

use futures::{channel::mpsc, future, stream, StreamExt};

use super::{
    FileBody, FileMeta, ModuleOutcome, ModuleSetup, SetupPlan, StorageModule, StorageResult,
    StoredFile,
};
use crate::{ConfigError, DepartError, StorageError};

#[derive(Clone)]
enum Modules {
    Single(Arc<dyn StorageModule>),
    FanOut(Vec<Arc<dyn StorageModule>>),
}

/// Routes each file to one storage module, or duplicates it across several.
///
/// Outcomes are always reported in module order, and removal mirrors storage:
/// only modules that stored a file are asked to remove it.
#[derive(Clone)]
pub struct StorageDispatcher {
    modules: Modules,
}

impl fmt::Debug for StorageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDispatcher")
            .field("modules", &self.module_count())
            .field("fan_out", &self.is_fan_out())
            .finish()
    }
}

impl StorageDispatcher {
    /// Wraps a single storage module.
    pub fn single(module: impl StorageModule) -> Self {
        Self::from_shared(Arc::new(module))
    }

    /// Wraps an already shared storage module.
    pub fn from_shared(module: Arc<dyn StorageModule>) -> Self {
        Self {
            modules: Modules::Single(module),
        }
    }

    /// Fans every file out to all `modules`.
    pub fn fan_out(modules: Vec<Arc<dyn StorageModule>>) -> Result<Self, ConfigError> {
        if modules.is_empty() {
            return Err(ConfigError::EmptyFanOut);
        }
        Ok(Self {
            modules: Modules::FanOut(modules),
        })
    }

    /// Returns the number of configured modules.
    pub fn module_count(&self) -> usize {
        match &self.modules {
            Modules::Single(_) => 1,
            Modules::FanOut(modules) => modules.len(),
        }
    }

    /// Returns `true` when files are duplicated across a module list.
    pub fn is_fan_out(&self) -> bool {
        matches!(self.modules, Modules::FanOut(_))
    }

    /// Expands a plan into one setup entry per module.
    pub fn resolve_setups(&self, plan: &SetupPlan) -> Result<Vec<ModuleSetup>, ConfigError> {
        let expected = self.module_count();
        match plan {
            SetupPlan::Default => Ok(vec![ModuleSetup::Default; expected]),
            SetupPlan::Single(setup) => Ok(vec![ModuleSetup::With(setup.clone()); expected]),
            SetupPlan::PerModule(setups) if setups.len() == expected => Ok(setups.clone()),
            SetupPlan::PerModule(setups) => Err(ConfigError::SetupLengthMismatch {
                expected,
                actual: setups.len(),
            }),
        }
    }

    /// Stores one file according to `plan`.
    ///
    /// When a fan-out module fails, copies already stored by the other modules
    /// are removed before the error is returned.
    pub async fn dispatch(
        &self,
        stream: FileBody<'_>,
        meta: &FileMeta,
        plan: &SetupPlan,
    ) -> Result<StorageResult, DepartError> {
        let setups = self.resolve_setups(plan)?;

        match &self.modules {
            Modules::Single(module) => {
                let outcome = store_with(module.as_ref(), stream, meta, &setups[0])
                    .await
                    .map_err(|err| {
                        DepartError::storage(&meta.field_name, &meta.original_name, &err)
                    })?;
                Ok(StorageResult::Single(outcome))
            }
            Modules::FanOut(modules) => self.fan_out_store(modules, stream, meta, &setups).await,
        }
    }

    async fn fan_out_store(
        &self,
        modules: &[Arc<dyn StorageModule>],
        stream: FileBody<'_>,
        meta: &FileMeta,
        setups: &[ModuleSetup],
    ) -> Result<StorageResult, DepartError> {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            field_name = meta.field_name.as_str(),
            original_name = meta.original_name.as_str(),
            modules = modules.len(),
            "dispatcher: fanning out file"
        );

        let mut senders = Vec::new();
        let mut stores = Vec::new();
        for (module, setup) in modules.iter().zip(setups) {
            let copy: FileBody<'_> = if matches!(setup, ModuleSetup::Skip) {
                Box::pin(stream::empty())
            } else {
                let (tx, rx) = mpsc::unbounded();
                senders.push(tx);
                Box::pin(rx)
            };
            stores.push(store_with(module.as_ref(), copy, meta, setup));
        }

        let pump = async move {
            let mut source = stream;
            let mut senders = senders;
            while let Some(item) = source.next().await {
                senders.retain(|tx| tx.unbounded_send(item.clone()).is_ok());
                if senders.is_empty() {
                    break;
                }
            }
        };

        let ((), results) = future::join(pump, future::join_all(stores)).await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    failures.push(DepartError::storage(
                        &meta.field_name,
                        &meta.original_name,
                        &err,
                    ));
                    outcomes.push(ModuleOutcome::Skipped);
                }
            }
        }

        if failures.is_empty() {
            return Ok(StorageResult::PerModule(outcomes));
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(
            field_name = meta.field_name.as_str(),
            original_name = meta.original_name.as_str(),
            failed = failures.len(),
            "dispatcher: fan-out store failed, removing stored copies"
        );

        let removals = self.remove(&StorageResult::PerModule(outcomes)).await;
        let mut failures = failures.into_iter();
        let mut first = failures
            .next()
            .unwrap_or_else(|| DepartError::internal("fan-out failure without an error"));
        for err in failures.chain(removals) {
            first.fold(err);
        }
        Err(first)
    }

    /// Removes every stored copy of a file.
    ///
    /// All modules are attempted; the returned list holds every failure.
    pub async fn remove(&self, result: &StorageResult) -> Vec<DepartError> {
        let pairs: Vec<(&dyn StorageModule, &StoredFile)> = match (&self.modules, result) {
            (Modules::Single(module), StorageResult::Single(outcome)) => outcome
                .stored()
                .map(|stored| (module.as_ref(), stored))
                .into_iter()
                .collect(),
            (Modules::FanOut(modules), StorageResult::PerModule(outcomes))
                if modules.len() == outcomes.len() =>
            {
                modules
                    .iter()
                    .zip(outcomes)
                    .filter_map(|(module, outcome)| {
                        outcome.stored().map(|stored| (module.as_ref(), stored))
                    })
                    .collect()
            }
            _ => {
                return vec![DepartError::internal(
                    "storage result does not match the configured storage modules",
                )]
            }
        };

        let removals = pairs.into_iter().map(|(module, stored)| async move {
            module
                .remove_file(stored)
                .await
                .map_err(|err| removal_error(stored, &err))
        });

        future::join_all(removals)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }
}

async fn store_with(
    module: &dyn StorageModule,
    stream: FileBody<'_>,
    meta: &FileMeta,
    setup: &ModuleSetup,
) -> Result<ModuleOutcome, StorageError> {
    match setup {
        ModuleSetup::Skip => Ok(ModuleOutcome::Skipped),
        ModuleSetup::Default => module.handle_file(stream, meta, None).await,
        ModuleSetup::With(setup) => module.handle_file(stream, meta, Some(setup)).await,
    }
}

fn removal_error(stored: &StoredFile, err: &StorageError) -> DepartError {
    DepartError::storage(&stored.field_name, &stored.original_name, err)
}
