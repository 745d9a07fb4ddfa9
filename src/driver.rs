use async_trait::async_trait;

use crate::error::DriverError;
use crate::model::{ElementState, PageSnapshot, PageState};
use crate::selector::Descriptor;

// ========================= Pluggable Subsystems =========================

/// Browser primitives over the single live page of a run.
///
/// Element operations take a [`Descriptor`] and act on its first match.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// State of the first element matching `descriptor`, or `None` when absent.
    async fn query(&self, descriptor: &Descriptor) -> Result<Option<ElementState>, DriverError>;

    async fn click(&self, target: &Descriptor) -> Result<(), DriverError>;
    async fn set_text(&self, target: &Descriptor, value: &str) -> Result<(), DriverError>;
    async fn choose_option(&self, target: &Descriptor, value: &str) -> Result<(), DriverError>;
    async fn press_key(&self, target: &Descriptor, key: &str) -> Result<(), DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;
    async fn title(&self) -> Result<String, DriverError>;

    /// Visible text of `target`, or of the whole document when `None`.
    async fn read_visible_text(&self, target: Option<&Descriptor>) -> Result<String, DriverError>;

    /// Best-effort wait for navigation and rendering to quiesce.
    async fn wait_for_settle(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Base64 PNG of the viewport, when the driver can capture one.
    async fn screenshot_b64(&self) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    async fn page_state(&self) -> Result<PageState, DriverError> {
        Ok(PageState { url: self.current_url().await?, title: self.title().await? })
    }
}

/// Turns the live page into a structured snapshot of interactive elements.
#[async_trait]
pub trait PageInspector<D: BrowserDriver + ?Sized>: Send + Sync {
    async fn snapshot(&self, session: &D) -> Result<PageSnapshot, DriverError>;
}
