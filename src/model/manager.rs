use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as StateLock;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::backend::{CancelFlag, LoadedModel, ModelLoader, NativeLoader};
use crate::error::{LoomError, Result};
use crate::types::{GenerationParams, ModelRole, ModelSpec};

/// Lifecycle of the model held for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// Counters kept per role while a model is resident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationStats {
    pub total_generations: usize,
    pub total_generated_chars: usize,
    pub last_latency_ms: Option<u64>,
}

/// Snapshot of one role for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RoleStatus {
    pub role: ModelRole,
    pub state: ModelState,
    pub spec: Option<ModelSpec>,
    pub effective_context: Option<usize>,
    pub last_error: Option<String>,
    pub stats: GenerationStats,
}

/// Outcome of [`ModelRegistry::unload_all`]. Errors are informational only.
#[derive(Debug, Clone, Default)]
pub struct UnloadReport {
    pub unloaded: Vec<ModelRole>,
    pub errors: Vec<(ModelRole, String)>,
}

#[derive(Debug)]
struct RoleInfo {
    state: ModelState,
    spec: Option<ModelSpec>,
    effective_context: Option<usize>,
    last_error: Option<String>,
    stats: GenerationStats,
}

impl Default for RoleInfo {
    fn default() -> Self {
        Self {
            state: ModelState::Unloaded,
            spec: None,
            effective_context: None,
            last_error: None,
            stats: GenerationStats::default(),
        }
    }
}

type Slot = Option<Box<dyn LoadedModel>>;

struct RoleEntry {
    role: ModelRole,
    info: StateLock<RoleInfo>,
    // held for the whole of a load, unload or generation on this role
    slot: Arc<Mutex<Slot>>,
    cancel: CancelFlag,
    loads_waiting: AtomicUsize,
}

/// Registers a load waiting for the role lock; the count drops however the wait ends.
struct WaitingLoad<'a>(&'a RoleEntry);

impl<'a> WaitingLoad<'a> {
    fn register(entry: &'a RoleEntry) -> Self {
        entry.loads_waiting.fetch_add(1, Ordering::SeqCst);
        entry.cancel.cancel();
        Self(entry)
    }
}

impl Drop for WaitingLoad<'_> {
    fn drop(&mut self) {
        self.0.loads_waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RoleEntry {
    fn new(role: ModelRole) -> Self {
        Self {
            role,
            info: StateLock::new(RoleInfo::default()),
            slot: Arc::new(Mutex::new(None)),
            cancel: CancelFlag::new(),
            loads_waiting: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> ModelState {
        self.info.lock().state
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.state() == ModelState::Loaded {
            Ok(())
        } else {
            Err(LoomError::ModelNotLoaded { role: self.role })
        }
    }

    fn mark_unloaded(&self, error: Option<String>) {
        let mut info = self.info.lock();
        info.state = ModelState::Unloaded;
        info.spec = None;
        info.effective_context = None;
        if error.is_some() {
            info.last_error = error;
        }
    }

    fn status(&self) -> RoleStatus {
        let info = self.info.lock();
        RoleStatus {
            role: self.role,
            state: info.state,
            spec: info.spec.clone(),
            effective_context: info.effective_context,
            last_error: info.last_error.clone(),
            stats: info.stats.clone(),
        }
    }
}

/// Owns the primary and auxiliary models.
///
/// Each role has its own lock; loads, unloads and generations on one role never
/// overlap, and a role never holds more than one model.
pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    primary: Arc<RoleEntry>,
    auxiliary: Arc<RoleEntry>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NativeLoader::new()))
    }
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            primary: Arc::new(RoleEntry::new(ModelRole::Primary)),
            auxiliary: Arc::new(RoleEntry::new(ModelRole::Auxiliary)),
        }
    }

    fn entry(&self, role: ModelRole) -> &Arc<RoleEntry> {
        match role {
            ModelRole::Primary => &self.primary,
            ModelRole::Auxiliary => &self.auxiliary,
        }
    }

    pub fn state(&self, role: ModelRole) -> ModelState {
        self.entry(role).state()
    }

    /// Fails with `ModelNotLoaded` unless the role is ready for generation.
    pub fn ensure_loaded(&self, role: ModelRole) -> Result<()> {
        self.entry(role).ensure_loaded()
    }

    pub fn status(&self) -> Vec<RoleStatus> {
        ModelRole::ALL
            .iter()
            .map(|role| self.entry(*role).status())
            .collect()
    }

    /// Ask the generation running on `role`, if any, to stop.
    pub fn cancel(&self, role: ModelRole) {
        tracing::info!(%role, "cancellation requested");
        self.entry(role).cancel.cancel();
    }

    /// Load `spec` into its role, unloading whatever the role held first.
    ///
    /// Once the role lock is taken the swap runs to completion on a blocking thread,
    /// even if the caller stops waiting for it.
    pub async fn load(&self, spec: ModelSpec) -> Result<()> {
        spec.validate()?;
        let entry = Arc::clone(self.entry(spec.role));

        let slot = {
            let _waiting = WaitingLoad::register(&entry);
            Arc::clone(&entry.slot).lock_owned().await
        };
        entry.cancel.reset();

        let loader = Arc::clone(&self.loader);
        let identifier = spec.identifier.clone();
        let task_entry = Arc::clone(&entry);
        tokio::task::spawn_blocking(move || swap_in(&task_entry, slot, loader.as_ref(), spec))
            .await
            .unwrap_or_else(|join_error| {
                let message = format!("loader task aborted: {join_error}");
                entry.mark_unloaded(Some(message.clone()));
                Err(LoomError::load(identifier, message))
            })
    }

    /// Unload both roles. Never fails; unload errors are logged and reported.
    pub async fn unload_all(&self) -> UnloadReport {
        let mut report = UnloadReport::default();
        for role in ModelRole::ALL {
            let entry = self.entry(role);
            entry.cancel.cancel();
            let mut slot = entry.slot.lock().await;
            entry.cancel.reset();

            if let Some(mut model) = slot.take() {
                match model.unload() {
                    Ok(()) => tracing::info!(%role, "model unloaded"),
                    Err(e) => {
                        tracing::warn!(%role, error = %e, "unload error ignored");
                        report.errors.push((role, e.to_string()));
                    }
                }
                report.unloaded.push(role);
            }
            entry.mark_unloaded(None);
        }
        report
    }

    /// Generate from a prompt that is already assembled.
    pub async fn generate(
        &self,
        role: ModelRole,
        prompt: String,
        params: GenerationParams,
    ) -> Result<String> {
        self.run(role, params, move |_| Ok(prompt)).await
    }

    /// Build a prompt against the resident model and generate from it, all under
    /// the role lock so the model cannot be swapped in between.
    pub async fn run<F>(
        &self,
        role: ModelRole,
        params: GenerationParams,
        prepare: F,
    ) -> Result<String>
    where
        F: FnOnce(&dyn LoadedModel) -> Result<String> + Send + 'static,
    {
        let entry = Arc::clone(self.entry(role));
        entry.ensure_loaded()?;
        params.validate()?;

        let slot = Arc::clone(&entry.slot).lock_owned().await;
        if entry.loads_waiting.load(Ordering::SeqCst) == 0 {
            entry.cancel.reset();
        }

        // the lock travels with the work, so a caller that stops waiting leaves the
        // slot and the role state consistent
        let task_entry = Arc::clone(&entry);
        tokio::task::spawn_blocking(move || generate_in(&task_entry, slot, params, prepare))
            .await
            .unwrap_or_else(|join_error| {
                let message = format!("inference task aborted: {join_error}");
                tracing::error!(%role, error = %message, "generation task failed");
                Err(LoomError::generation(message))
            })
    }
}

/// Body of a load once the role lock is held. Runs on a blocking thread.
fn swap_in(
    entry: &RoleEntry,
    mut slot: OwnedMutexGuard<Slot>,
    loader: &dyn ModelLoader,
    spec: ModelSpec,
) -> Result<()> {
    entry.info.lock().state = ModelState::Loading;

    if let Some(mut previous) = slot.take() {
        if let Err(e) = previous.unload() {
            tracing::warn!(
                role = %spec.role,
                error = %e,
                "previous model reported an unload error"
            );
        }
        drop(previous);
        tracing::info!(role = %spec.role, "previous model released for hot-swap");
    }

    tracing::info!(
        role = %spec.role,
        library = %spec.inference_library,
        device = %spec.device,
        identifier = %spec.identifier,
        "loading model"
    );
    let start = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| loader.load(&spec)))
        .unwrap_or_else(|payload| {
            Err(LoomError::load(
                spec.identifier.clone(),
                format!("loader panicked: {}", panic_message(payload.as_ref())),
            ))
        });

    match outcome {
        Ok(model) => {
            let effective_context = model.max_context();
            *slot = Some(model);
            let mut info = entry.info.lock();
            info.state = ModelState::Loaded;
            info.effective_context = Some(effective_context);
            info.spec = Some(spec.clone());
            info.last_error = None;
            info.stats = GenerationStats::default();
            tracing::info!(
                role = %spec.role,
                identifier = %spec.identifier,
                effective_context,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "model loaded"
            );
            Ok(())
        }
        Err(err) => {
            entry.info.lock().state = ModelState::Failed;
            tracing::error!(
                role = %spec.role,
                identifier = %spec.identifier,
                error = %err,
                "model load failed"
            );
            entry.mark_unloaded(Some(err.to_string()));
            Err(err)
        }
    }
}

/// Body of a generation once the role lock is held. Runs on a blocking thread.
fn generate_in<F>(
    entry: &RoleEntry,
    mut slot: OwnedMutexGuard<Slot>,
    params: GenerationParams,
    prepare: F,
) -> Result<String>
where
    F: FnOnce(&dyn LoadedModel) -> Result<String>,
{
    let role = entry.role;
    let mut model = slot.take().ok_or(LoomError::ModelNotLoaded { role })?;
    let cancel = entry.cancel.clone();
    let start = Instant::now();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        prepare(model.as_ref()).and_then(|prompt| model.generate(&prompt, &params, &cancel))
    }));

    match outcome {
        Ok(result) => {
            *slot = Some(model);
            if let Ok(text) = &result {
                record_generation(entry, text, start.elapsed());
            }
            result
        }
        Err(payload) => {
            drop(model);
            let message = format!("inference engine panicked: {}", panic_message(payload.as_ref()));
            tracing::error!(%role, error = %message, "generation panicked; model released");
            entry.mark_unloaded(Some(message.clone()));
            Err(LoomError::generation(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn record_generation(entry: &RoleEntry, text: &str, elapsed: Duration) {
    let mut info = entry.info.lock();
    info.stats.total_generations += 1;
    info.stats.total_generated_chars += text.chars().count();
    info.stats.last_latency_ms = Some(elapsed.as_millis() as u64);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::TokenEstimator;
    use crate::types::{DeviceKind, InferenceLibrary};
    use std::sync::atomic::AtomicBool;

    /// Shared counters observed by the mock loader and its models.
    #[derive(Default)]
    pub(crate) struct Counters {
        pub loads: AtomicUsize,
        pub live: AtomicUsize,
        pub max_live: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub fail_load: AtomicBool,
        pub fail_unload: AtomicBool,
        pub panic_generate: AtomicBool,
        pub slow_generate: AtomicBool,
        pub slow_load: AtomicBool,
        pub last_prompt: StateLock<Option<String>>,
    }

    pub(crate) struct MockLoader {
        pub counters: Arc<Counters>,
        pub max_context: usize,
    }

    impl MockLoader {
        pub fn new(max_context: usize) -> (Arc<Self>, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            let loader = Arc::new(Self {
                counters: Arc::clone(&counters),
                max_context,
            });
            (loader, counters)
        }
    }

    impl ModelLoader for MockLoader {
        fn load(&self, spec: &ModelSpec) -> Result<Box<dyn LoadedModel>> {
            self.counters.loads.fetch_add(1, Ordering::SeqCst);
            if self.counters.slow_load.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(150));
            }
            if self.counters.fail_load.load(Ordering::SeqCst) {
                return Err(LoomError::load(spec.identifier.clone(), "corrupt weights"));
            }
            let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(MockModel {
                counters: Arc::clone(&self.counters),
                library: spec.inference_library,
                max_context: self.max_context.min(spec.max_context),
                loaded: true,
            }))
        }
    }

    pub(crate) struct MockModel {
        counters: Arc<Counters>,
        library: InferenceLibrary,
        max_context: usize,
        loaded: bool,
    }

    impl MockModel {
        fn release(&mut self) {
            if self.loaded {
                self.loaded = false;
                self.counters.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    impl Drop for MockModel {
        fn drop(&mut self) {
            self.release();
        }
    }

    impl TokenEstimator for MockModel {
        fn estimate_tokens(&self, text: &str) -> usize {
            text.chars().count()
        }
    }

    impl LoadedModel for MockModel {
        fn library(&self) -> InferenceLibrary {
            self.library
        }

        fn max_context(&self) -> usize {
            self.max_context
        }

        fn generate(
            &mut self,
            prompt: &str,
            params: &GenerationParams,
            cancel: &CancelFlag,
        ) -> Result<String> {
            let running = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_in_flight.fetch_max(running, Ordering::SeqCst);
            *self.counters.last_prompt.lock() = Some(prompt.to_string());

            if self.counters.panic_generate.load(Ordering::SeqCst) {
                panic!("native fault");
            }
            let steps = if self.counters.slow_generate.load(Ordering::SeqCst) { 500 } else { 5 };
            let mut cancelled = false;
            for _ in 0..steps {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

            if cancelled {
                return Err(LoomError::generation("generation was cancelled"));
            }
            Ok(format!("  \n generated {} tokens", params.max_new_tokens))
        }

        fn unload(&mut self) -> Result<()> {
            self.release();
            if self.counters.fail_unload.load(Ordering::SeqCst) {
                return Err(LoomError::generation("driver refused to free memory"));
            }
            Ok(())
        }

        fn is_loaded(&self) -> bool {
            self.loaded
        }
    }

    pub(crate) fn spec(role: ModelRole, identifier: &str) -> ModelSpec {
        ModelSpec {
            identifier: identifier.to_string(),
            inference_library: InferenceLibrary::Transformers,
            device: DeviceKind::Cpu,
            role,
            max_context: 1024,
        }
    }

    fn registry() -> (ModelRegistry, Arc<Counters>) {
        let (loader, counters) = MockLoader::new(512);
        (ModelRegistry::new(loader), counters)
    }

    #[tokio::test]
    async fn test_load_reports_effective_context() {
        let (registry, _) = registry();
        registry.load(spec(ModelRole::Primary, "gpt2")).await.unwrap();

        let status = registry.status();
        assert_eq!(status[0].state, ModelState::Loaded);
        assert_eq!(status[0].effective_context, Some(512));
        assert_eq!(status[1].state, ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_hot_swap_never_holds_two_models() {
        let (registry, counters) = registry();
        registry.load(spec(ModelRole::Primary, "first")).await.unwrap();
        registry.load(spec(ModelRole::Primary, "second")).await.unwrap();

        assert_eq!(counters.loads.load(Ordering::SeqCst), 2);
        assert_eq!(counters.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(counters.live.load(Ordering::SeqCst), 1);
        let status = registry.status();
        assert_eq!(status[0].spec.as_ref().unwrap().identifier, "second");
    }

    #[tokio::test]
    async fn test_failed_load_reverts_to_unloaded() {
        let (registry, counters) = registry();
        registry.load(spec(ModelRole::Auxiliary, "ok")).await.unwrap();
        counters.fail_load.store(true, Ordering::SeqCst);

        let err = registry.load(spec(ModelRole::Auxiliary, "bad")).await.unwrap_err();
        assert_eq!(err.kind(), "load_error");
        assert_eq!(registry.state(ModelRole::Auxiliary), ModelState::Unloaded);
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);

        let status = &registry.status()[1];
        assert!(status.last_error.as_ref().unwrap().contains("corrupt weights"));

        let err = registry
            .generate(ModelRole::Auxiliary, "x".into(), GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LoomError::ModelNotLoaded { role: ModelRole::Auxiliary }));
    }

    #[tokio::test]
    async fn test_exllamav2_off_cuda_never_reaches_loader() {
        let (registry, counters) = registry();
        let mut bad = spec(ModelRole::Primary, "model-exl2");
        bad.inference_library = InferenceLibrary::ExLlamaV2;
        bad.device = DeviceKind::Cpu;

        let err = registry.load(bad).await.unwrap_err();
        assert!(matches!(err, LoomError::ConfigurationError { .. }));
        assert_eq!(counters.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unload_all_then_generate_fails_on_both_roles() {
        let (registry, counters) = registry();
        registry.load(spec(ModelRole::Primary, "p")).await.unwrap();
        registry.load(spec(ModelRole::Auxiliary, "a")).await.unwrap();

        let report = registry.unload_all().await;
        assert_eq!(report.unloaded.len(), 2);
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);

        for role in ModelRole::ALL {
            let err = registry
                .generate(role, "hello".into(), GenerationParams::default())
                .await
                .unwrap_err();
            assert!(matches!(err, LoomError::ModelNotLoaded { .. }));
        }
    }

    #[tokio::test]
    async fn test_unload_all_swallows_unload_errors() {
        let (registry, counters) = registry();
        registry.load(spec(ModelRole::Primary, "p")).await.unwrap();
        counters.fail_unload.store(true, Ordering::SeqCst);

        let report = registry.unload_all().await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, ModelRole::Primary);
        assert_eq!(registry.state(ModelRole::Primary), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_generation_updates_stats() {
        let (registry, _) = registry();
        registry.load(spec(ModelRole::Primary, "p")).await.unwrap();
        let text = registry
            .generate(ModelRole::Primary, "Once".into(), GenerationParams::default())
            .await
            .unwrap();
        assert!(text.contains("generated 100 tokens"));

        let stats = &registry.status()[0].stats;
        assert_eq!(stats.total_generations, 1);
        assert_eq!(stats.total_generated_chars, text.chars().count());
        assert!(stats.last_latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_invalid_params_checked_after_role_state() {
        let (registry, _) = registry();
        let bad = GenerationParams {
            temperature: 0.0,
            ..Default::default()
        };
        let err = registry
            .generate(ModelRole::Primary, "x".into(), bad.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, LoomError::ModelNotLoaded { .. }));

        registry.load(spec(ModelRole::Primary, "p")).await.unwrap();
        let err = registry
            .generate(ModelRole::Primary, "x".into(), bad)
            .await
            .unwrap_err();
        assert!(matches!(err, LoomError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn test_panicking_engine_is_contained() {
        let (registry, counters) = registry();
        registry.load(spec(ModelRole::Primary, "p")).await.unwrap();
        counters.panic_generate.store(true, Ordering::SeqCst);

        let err = registry
            .generate(ModelRole::Primary, "x".into(), GenerationParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "generation_error");
        assert_eq!(registry.state(ModelRole::Primary), ModelState::Unloaded);
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_generations_are_serialized() {
        let (registry, counters) = registry();
        let registry = Arc::new(registry);
        registry.load(spec(ModelRole::Primary, "p")).await.unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let prompt = format!("prompt {i}");
                    registry
                        .generate(ModelRole::Primary, prompt, GenerationParams::default())
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(counters.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(registry.status()[0].stats.total_generations, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_cancels_running_generation() {
        let (registry, counters) = registry();
        let registry = Arc::new(registry);
        registry.load(spec(ModelRole::Primary, "old")).await.unwrap();
        counters.slow_generate.store(true, Ordering::SeqCst);

        let running = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .generate(ModelRole::Primary, "long".into(), GenerationParams::default())
                    .await
            })
        };
        while counters.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let start = Instant::now();
        registry.load(spec(ModelRole::Primary, "new")).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));

        let err = running.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(counters.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_stops_generation_but_keeps_model() {
        let (registry, counters) = registry();
        let registry = Arc::new(registry);
        registry.load(spec(ModelRole::Auxiliary, "aux")).await.unwrap();
        counters.slow_generate.store(true, Ordering::SeqCst);

        let running = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .generate(ModelRole::Auxiliary, "long".into(), GenerationParams::default())
                    .await
            })
        };
        while counters.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        registry.cancel(ModelRole::Auxiliary);
        assert!(running.await.unwrap().is_err());
        assert_eq!(registry.state(ModelRole::Auxiliary), ModelState::Loaded);

        counters.slow_generate.store(false, Ordering::SeqCst);
        assert!(registry
            .generate(ModelRole::Auxiliary, "again".into(), GenerationParams::default())
            .await
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_waiting_load_leaves_role_usable() {
        let (registry, counters) = registry();
        let registry = Arc::new(registry);
        counters.slow_load.store(true, Ordering::SeqCst);

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.load(spec(ModelRole::Primary, "first")).await })
        };
        while registry.state(ModelRole::Primary) != ModelState::Loading {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let gave_up = tokio::time::timeout(
            Duration::from_millis(10),
            registry.load(spec(ModelRole::Primary, "second")),
        )
        .await;
        assert!(gave_up.is_err());
        first.await.unwrap().unwrap();
        counters.slow_load.store(false, Ordering::SeqCst);

        for _ in 0..3 {
            let result = registry
                .generate(ModelRole::Primary, "x".into(), GenerationParams::default())
                .await;
            assert!(result.is_ok(), "{result:?}");
        }
        assert_eq!(registry.state(ModelRole::Primary), ModelState::Loaded);
        assert_eq!(registry.status()[0].spec.as_ref().unwrap().identifier, "first");
        assert_eq!(counters.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_finishes_after_caller_stops_waiting() {
        let (registry, counters) = registry();
        registry.load(spec(ModelRole::Auxiliary, "old")).await.unwrap();
        counters.slow_load.store(true, Ordering::SeqCst);

        let gave_up = tokio::time::timeout(
            Duration::from_millis(20),
            registry.load(spec(ModelRole::Auxiliary, "new")),
        )
        .await;
        assert!(gave_up.is_err());

        let swapped = |registry: &ModelRegistry| {
            let status = &registry.status()[1];
            status.state == ModelState::Loaded
                && status.spec.as_ref().is_some_and(|s| s.identifier == "new")
        };
        for _ in 0..200 {
            if swapped(&registry) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(swapped(&registry));
        assert_eq!(counters.live.load(Ordering::SeqCst), 1);
        assert_eq!(counters.max_live.load(Ordering::SeqCst), 1);
    }
}
