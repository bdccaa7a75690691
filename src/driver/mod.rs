pub mod backend;
pub mod terminal;
pub mod types;

pub use backend::{DEFAULT_BOARD, DEFAULT_COLUMNS, Faults, MAX_FRAMEBUFFER_PIXELS, MockFramebuffer, SimulatedBoard, SimulatedDriver, SimulatedSessionFactory};
pub use terminal::{CELL_HEIGHT, CELL_WIDTH, PtyDriver, PtySessionFactory, Screen, ScreenParser};
pub use types::{DriverError, DriverResult, Element, ElementSnapshot, EnvironmentProfile, MAX_DIMENSION, Screenshot, SnapshotId};

/// One exclusive automation session against the target application.
///
/// Nothing here is assumed infallible; every call may fail with a
/// [`DriverError`].
pub trait AutomationDriver: Send {
    /// Read every actionable element, in position order
    fn capture_snapshot(&mut self) -> DriverResult<ElementSnapshot>;

    /// Click `element` as it was captured.
    ///
    /// Fails with [`DriverError::ElementNotFound`] if the live application no
    /// longer shows that value at that position.
    fn click(&mut self, element: &Element) -> DriverResult<()>;

    fn screenshot(&mut self) -> DriverResult<Screenshot>;

    /// End the session. Calls after the first fail with [`DriverError::Closed`].
    fn close(&mut self) -> DriverResult<()>;
}

/// Opens fresh sessions sized to an environment
pub trait SessionFactory: Send + Sync {
    fn open_session(&self, environment: &EnvironmentProfile) -> DriverResult<Box<dyn AutomationDriver>>;
}
