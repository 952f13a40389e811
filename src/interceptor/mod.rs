//! Image interception.
//!
//! Call sites never load images directly. They assign a URL to an
//! [`ImageTarget`] through the application's [`LoaderSlot`]. By default the
//! slot passes URLs straight through. [`install`] swaps in an
//! [`ImageCompressionService`] and returns a [`Teardown`] guard that puts the
//! previous loader back and releases everything the service created.

pub mod eligibility;
pub mod service;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

pub use eligibility::{opt_out, Eligibility, EligibilityFilter, PassReason};
pub use service::ImageCompressionService;

/// Anything with an assignable image source.
pub trait ImageTarget: Send + Sync {
    fn set_src(&self, src: &str);

    fn src(&self) -> Option<String>;
}

/// A detached image element. Its source can be awaited.
pub struct ImageElement {
    src: watch::Sender<Option<String>>,
}

impl ImageElement {
    pub fn new() -> Self {
        let (src, _) = watch::channel(None);
        Self { src }
    }

    /// Waits until a source has been assigned and returns it.
    pub async fn loaded(&self) -> Option<String> {
        let mut rx = self.src.subscribe();
        let src = rx.wait_for(Option::is_some).await.ok()?;
        src.clone()
    }
}

impl Default for ImageElement {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageTarget for ImageElement {
    fn set_src(&self, src: &str) {
        self.src.send_replace(Some(src.to_string()));
    }

    fn src(&self) -> Option<String> {
        self.src.borrow().clone()
    }
}

/// Decides what source an image target ends up with.
pub trait ImageLoader: Send + Sync {
    /// Fire and forget. The target's source is set now or once work settles.
    fn assign(&self, target: Arc<dyn ImageTarget>, url: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughLoader;

impl ImageLoader for PassthroughLoader {
    fn assign(&self, target: Arc<dyn ImageTarget>, url: &str) {
        target.set_src(url);
    }
}

/// The loader every call site goes through.
pub struct LoaderSlot {
    current: RwLock<Arc<dyn ImageLoader>>,
}

impl LoaderSlot {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(PassthroughLoader)),
        }
    }

    pub fn assign(&self, target: Arc<dyn ImageTarget>, url: &str) {
        // Clone out so the lock is not held while the loader runs
        let loader = self.current.read().clone();
        loader.assign(target, url);
    }

    /// Installs `loader` and returns the one it replaced.
    pub fn replace(&self, loader: Arc<dyn ImageLoader>) -> Arc<dyn ImageLoader> {
        std::mem::replace(&mut *self.current.write(), loader)
    }

    /// Puts `previous` back only while `installed` is still the current loader.
    pub fn restore(&self, installed: &Arc<dyn ImageLoader>, previous: Arc<dyn ImageLoader>) -> bool {
        let mut current = self.current.write();
        if !same_loader(&*current, installed) {
            return false;
        }
        *current = previous;
        true
    }
}

// Compare data pointers only, vtables may differ between codegen units
fn same_loader(a: &Arc<dyn ImageLoader>, b: &Arc<dyn ImageLoader>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Default for LoaderSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes every assignment through `service` until the returned guard is torn down.
pub fn install(slot: &Arc<LoaderSlot>, service: ImageCompressionService) -> Teardown {
    let installed: Arc<dyn ImageLoader> = Arc::new(service.clone());
    let previous = slot.replace(installed.clone());
    log::info!("Image interceptor installed");
    Teardown {
        slot: slot.clone(),
        installed,
        previous: Mutex::new(Some(previous)),
        service,
    }
}

/// Restores the previous loader and stops the service. Runs at most once,
/// on [`Teardown::teardown`] or on drop.
///
/// Installs may nest. A guard torn down while a later install is still
/// active leaves the slot alone; its stopped service passes URLs through
/// until the later guard puts it back.
pub struct Teardown {
    slot: Arc<LoaderSlot>,
    installed: Arc<dyn ImageLoader>,
    previous: Mutex<Option<Arc<dyn ImageLoader>>>,
    service: ImageCompressionService,
}

impl Teardown {
    pub fn teardown(&self) {
        let Some(previous) = self.previous.lock().take() else {
            return;
        };
        if !self.slot.restore(&self.installed, previous) {
            log::debug!("A later interceptor owns the slot, leaving it in place");
        }
        self.service.stop();
        log::info!("Image interceptor removed");
    }

    pub fn is_torn_down(&self) -> bool {
        self.previous.lock().is_none()
    }

    pub fn service(&self) -> &ImageCompressionService {
        &self.service
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader(AtomicUsize);

    impl ImageLoader for CountingLoader {
        fn assign(&self, target: Arc<dyn ImageTarget>, url: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
            target.set_src(&format!("counted:{}", url));
        }
    }

    #[test]
    fn test_passthrough_slot() {
        let slot = LoaderSlot::new();
        let element = Arc::new(ImageElement::new());
        assert_eq!(element.src(), None);

        slot.assign(element.clone(), "/images/a.jpg");
        assert_eq!(element.src().as_deref(), Some("/images/a.jpg"));
    }

    #[test]
    fn test_replace_returns_previous() {
        let slot = LoaderSlot::new();
        let counting = Arc::new(CountingLoader(AtomicUsize::new(0)));
        let previous = slot.replace(counting.clone());

        let element = Arc::new(ImageElement::new());
        slot.assign(element.clone(), "/a.jpg");
        assert_eq!(element.src().as_deref(), Some("counted:/a.jpg"));
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        slot.replace(previous);
        slot.assign(element.clone(), "/b.jpg");
        assert_eq!(element.src().as_deref(), Some("/b.jpg"));
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restore_only_replaces_the_installed_loader() {
        let slot = LoaderSlot::new();
        let first: Arc<dyn ImageLoader> = Arc::new(CountingLoader(AtomicUsize::new(0)));
        let second: Arc<dyn ImageLoader> = Arc::new(CountingLoader(AtomicUsize::new(0)));
        let original = slot.replace(first.clone());
        let previous = slot.replace(second.clone());

        // `first` is no longer current, so its restore is refused
        assert!(!slot.restore(&first, original.clone()));
        assert!(slot.restore(&second, previous));

        let element = Arc::new(ImageElement::new());
        slot.assign(element.clone(), "/a.jpg");
        assert_eq!(element.src().as_deref(), Some("counted:/a.jpg"));
    }

    #[tokio::test]
    async fn test_element_loaded_resolves_after_assignment() {
        let element = Arc::new(ImageElement::new());
        let waiter = {
            let element = element.clone();
            tokio::spawn(async move { element.loaded().await })
        };
        tokio::task::yield_now().await;

        element.set_src("blob:http://localhost:8000/abc");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("blob:http://localhost:8000/abc"));
    }
}
