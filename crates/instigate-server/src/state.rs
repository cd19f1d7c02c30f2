use instigate_core::definition::{InstigatorDefinition, InstigatorId};
use instigate_core::instance::Instance;
use instigate_core::storage::InstigatorStorage;
use instigate_core::workspace::{DefinitionSource, LocationLoad};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub home: PathBuf,
    pub storage: Arc<dyn InstigatorStorage>,
    pub source: Arc<dyn DefinitionSource>,
    /// Upper bound for `POST …/test` dry runs.
    pub evaluation_timeout: Duration,
}

impl AppState {
    pub fn new(
        home: PathBuf,
        storage: Arc<dyn InstigatorStorage>,
        source: Arc<dyn DefinitionSource>,
    ) -> Self {
        Self {
            home,
            storage,
            source,
            evaluation_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_instance(instance: &Instance, source: Arc<dyn DefinitionSource>) -> Self {
        Self {
            evaluation_timeout: instance.config().coordinator.evaluation_timeout(),
            ..Self::new(instance.home().to_path_buf(), instance.storage(), source)
        }
    }

    pub fn with_evaluation_timeout(mut self, timeout: Duration) -> Self {
        self.evaluation_timeout = timeout;
        self
    }
}

/// Result of one blocking definition load.
pub(crate) struct Loaded {
    pub definitions: Vec<InstigatorDefinition>,
    pub errors: Vec<(String, String)>,
}

impl Loaded {
    pub(crate) fn load(source: &dyn DefinitionSource) -> Self {
        let mut definitions = Vec::new();
        let mut errors = Vec::new();
        for load in source.load() {
            match load {
                LocationLoad::Loaded(location) => definitions.extend(location.definitions),
                LocationLoad::Failed { location, error } => errors.push((location, error)),
            }
        }
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            definitions,
            errors,
        }
    }

    pub(crate) fn find(&self, id: &InstigatorId) -> Option<&InstigatorDefinition> {
        self.definitions.iter().find(|d| &d.id == id)
    }

    pub(crate) fn location_error(&self, location: &str) -> Option<&str> {
        self.errors
            .iter()
            .find(|(name, _)| name == location)
            .map(|(_, error)| error.as_str())
    }
}
