use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    /// Accumulated pair count at which a snapshot fetch stops querying further
    /// endpoints. Unused for streaming endpoints.
    pub min_coverage: usize,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, min_coverage: usize) -> Self {
        Self {
            url: url.into(),
            min_coverage,
        }
    }
}

/// Ordered candidate endpoints for one transport kind, remembering the last
/// one that worked so later attempts start there.
#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
    last_successful: AtomicUsize,
}

impl EndpointPool {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            last_successful: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        self.endpoints.get(index % self.endpoints.len())
    }

    pub fn preferred_index(&self) -> usize {
        self.last_successful.load(Ordering::Relaxed)
    }

    pub fn remember(&self, index: usize) {
        if self.endpoints.is_empty() {
            return;
        }
        self.last_successful
            .store(index % self.endpoints.len(), Ordering::Relaxed);
    }

    /// Every endpoint exactly once, round-robin from `start_index`.
    pub fn next(&self, start_index: usize) -> impl Iterator<Item = (usize, &Endpoint)> + '_ {
        let len = self.endpoints.len();
        (0..len).map(move |offset| {
            let index = (start_index + offset) % len;
            (index, &self.endpoints[index])
        })
    }
}
