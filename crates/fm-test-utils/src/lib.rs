// fm-test-utils: Shared test utilities for the freezer monitor.
//
// Provides a mock sensor client that speaks the length-prefixed JSON wire
// format, for integration testing of the ingestor.

pub mod mock_sensor;

pub use mock_sensor::MockSensor;
