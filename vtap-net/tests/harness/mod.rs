//! Test harness for tap device integration tests
//!
//! Provides a recording virtual wire, a scripted stack backend and a
//! notifier that records what the device asked of it.

#![allow(dead_code)]

pub mod mock_stack;
pub mod recording;

use std::sync::Arc;

pub use mock_stack::MockStack;
pub use recording::{RecordingNotifier, RecordingWire};

use tempfile::TempDir;
use vtap_net::{
    EthernetAddress, NetworkId, StackAdapter, TapConfig, TapDevice, TapSettings,
};

pub const TEST_NETWORK: NetworkId = NetworkId(0x8056_c2e2_1c00_0001);

pub const TEST_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// A tap device wired to recording collaborators.
pub struct TestTap {
    pub tap: TapDevice,
    pub wire: RecordingWire,
    pub notifier: Arc<RecordingNotifier>,
    pub stack: Option<Arc<MockStack>>,
    _storage: TempDir,
}

impl TestTap {
    /// Device backed by a fresh [`MockStack`].
    pub fn with_mock(settings: TapSettings) -> Self {
        Self::build(settings, Some(Arc::new(MockStack::new())))
    }

    /// Device with no stack backend at all.
    pub fn without_backend() -> Self {
        Self::build(TapSettings::default(), None)
    }

    pub fn build(settings: TapSettings, stack: Option<Arc<MockStack>>) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let storage = TempDir::new().expect("tempdir");
        let wire = RecordingWire::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let config = TapConfig::new(storage.path(), TEST_MAC, TEST_NETWORK).with_settings(settings);

        let adapter = stack.clone().map(|s| s as Arc<dyn StackAdapter>);
        let tap = TapDevice::builder(config, wire.wire())
            .notifier(notifier.clone())
            .adapter(adapter)
            .spawn()
            .expect("spawn tap");

        Self {
            tap,
            wire,
            notifier,
            stack,
            _storage: storage,
        }
    }

    pub fn stack(&self) -> &MockStack {
        self.stack.as_deref().expect("tap has no mock stack")
    }
}
