use crate::error::CoreError;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type BackendFactory<T> = Box<dyn Fn(&str) -> Result<Arc<T>, CoreError> + Send + Sync>;

struct Candidate<T: ?Sized> {
    name: String,
    factory: BackendFactory<T>,
}

/// One exclusive resource per execution context, built from a prioritised
/// list of candidate backends where the first that builds wins.
pub struct BackendPool<T: ?Sized> {
    candidates: Vec<Candidate<T>>,
    resources: Mutex<HashMap<String, (String, Arc<T>)>>,
}

impl<T: ?Sized> Default for BackendPool<T> {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            resources: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: ?Sized> BackendPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candidate<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<T>, CoreError> + Send + Sync + 'static,
    {
        self.candidates.push(Candidate {
            name: name.to_string(),
            factory: Box::new(factory),
        });
        self
    }

    pub fn candidate_names(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get(&self, context: &str) -> Result<Arc<T>, CoreError> {
        let mut resources = self
            .resources
            .lock()
            .map_err(|_| CoreError::NoBackendAvailable(context.to_string()))?;
        if let Some((_, resource)) = resources.get(context) {
            return Ok(resource.clone());
        }
        for candidate in self.candidates.iter() {
            match (candidate.factory)(context) {
                Ok(resource) => {
                    debug!("context {} uses backend {}", context, candidate.name);
                    resources.insert(
                        context.to_string(),
                        (candidate.name.clone(), resource.clone()),
                    );
                    return Ok(resource);
                }
                Err(err) => {
                    warn!(
                        "backend {} unavailable for {}: {}",
                        candidate.name, context, err
                    );
                }
            }
        }
        Err(CoreError::NoBackendAvailable(context.to_string()))
    }

    /// Name of the backend serving `context`, if one was built.
    pub fn backend_name(&self, context: &str) -> Option<String> {
        self.resources
            .lock()
            .ok()
            .and_then(|resources| resources.get(context).map(|(name, _)| name.clone()))
    }

    pub fn release(&self, context: &str) -> bool {
        self.resources
            .lock()
            .map(|mut resources| resources.remove(context).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.resources
            .lock()
            .map(|resources| resources.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
