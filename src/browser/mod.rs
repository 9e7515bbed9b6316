pub mod artifacts;
pub mod behavior;
pub mod captcha;
pub mod challenge;
pub mod fingerprint;
pub mod session;

// Re-export common types
pub use artifacts::{ArtifactStore, SessionArtifacts};
pub use behavior::BehaviorSimulator;
pub use captcha::CaptchaSolver;
pub use challenge::ChallengeDetector;
pub use fingerprint::{CompleteFingerprint, FingerprintManager};
pub use session::{BrowserDriver, BrowserHandle, BrowserLauncher, WaitCondition, WebDriverLauncher};
