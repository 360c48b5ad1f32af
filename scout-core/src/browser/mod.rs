mod cdp;
mod error;
mod page;

pub use cdp::{CdpBrowser, CdpPage};
pub use error::{BrowserError, BrowserResult};
pub use page::{BrowserElement, BrowserPage, ElementBounds, PageFactory};
