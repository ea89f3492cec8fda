pub mod conversion;
pub mod feature_gate;

pub use conversion::ConversionState;
pub use feature_gate::{FeatureGate, GateSettings, GateTransition};
