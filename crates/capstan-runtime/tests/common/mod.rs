//! Shared setup for runtime integration tests.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use capstan_runtime::{ExtensionId, IntegrityVerifier, Runtime, RuntimeBuilder};
use capstan_test::{CountingVerifier, TestRoots, init_test_tracing, sample_loader};
use semver::Version;

/// A runtime over a temporary root, wired to the sample extensions.
#[allow(dead_code)]
pub struct Harness {
    /// The runtime under test.
    pub runtime: Runtime,
    /// Verification counter shared with the runtime.
    pub verifier: Arc<CountingVerifier>,
    /// Pinger shutdown counter shared with the loader.
    pub shutdowns: Arc<AtomicUsize>,
    /// Temporary directories (held to prevent cleanup).
    pub roots: TestRoots,
}

#[allow(dead_code)]
impl Harness {
    /// Default policy, no trusted keys.
    pub fn new() -> Self {
        Self::with(CountingVerifier::new(), |b| b)
    }

    /// Custom verifier and extra builder settings.
    pub fn with(
        verifier: CountingVerifier,
        configure: impl FnOnce(RuntimeBuilder) -> RuntimeBuilder,
    ) -> Self {
        init_test_tracing();
        let roots = TestRoots::new();
        let verifier = Arc::new(verifier);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let shared: Arc<dyn IntegrityVerifier> = verifier.clone();
        let builder = Runtime::builder()
            .root(roots.root())
            .verifier(shared)
            .loader(sample_loader(Arc::clone(&shutdowns)));
        Self {
            runtime: configure(builder).build(),
            verifier,
            shutdowns,
            roots,
        }
    }
}

#[allow(dead_code)]
pub fn id(s: &str) -> ExtensionId {
    ExtensionId::new(s).unwrap()
}

#[allow(dead_code)]
pub fn v(s: &str) -> Version {
    Version::parse(s).unwrap()
}
