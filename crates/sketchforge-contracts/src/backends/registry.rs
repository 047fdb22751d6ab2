use std::sync::Arc;

pub trait NamedBackend {
    fn id(&self) -> &str;
}

impl<T: NamedBackend + ?Sized> NamedBackend for Box<T> {
    fn id(&self) -> &str {
        (**self).id()
    }
}

impl<T: NamedBackend + ?Sized> NamedBackend for Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }
}

/// Backends in fixed priority order. Order is the dispatch order and is
/// never re-sorted.
#[derive(Debug, Clone)]
pub struct BackendRegistry<T: NamedBackend> {
    backends: Vec<T>,
}

impl<T: NamedBackend> BackendRegistry<T> {
    pub fn new(backends: Vec<T>) -> Self {
        Self { backends }
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.backends.iter().find(|backend| backend.id() == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|backend| backend.id().to_string())
            .collect()
    }

    pub fn backends(&self) -> &[T] {
        self.backends.as_slice()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Id of the final, always-tried fallback.
    pub fn last_resort(&self) -> Option<&str> {
        self.backends.last().map(|backend| backend.id())
    }
}
