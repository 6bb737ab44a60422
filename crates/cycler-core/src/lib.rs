pub mod charge;
pub mod clock;
pub mod control_loop;
pub mod cycle;
pub mod discharge;
pub mod instrument;
pub mod policy;
pub mod profile;
pub mod safety;
mod safety_proptest;
pub mod sampler;
#[cfg(feature = "simulation")]
pub mod sim;
pub mod sync;
pub mod tags;
#[cfg(test)]
pub(crate) mod testing;

pub use charge::{ChargeController, ChargeState};
pub use clock::{Clock, ManualClock, ScaledClock, SystemClock};
pub use control_loop::{CycleError, Phase, RunSummary, TerminationReason};
pub use cycle::{CyclePlan, CycleReport, CycleRunner, Mode};
pub use discharge::{DischargeController, DischargeState};
pub use instrument::{
    FacadeStats, MeasureError, Measurement, ParkOutcome, PowerSupply, Reading, SupplyIo,
    TransportError,
};
pub use policy::CyclePolicy;
pub use profile::{BatteryProfile, ProfileError};
pub use safety::{SafetyViolation, Setpoint, SupplyLimits, Unvalidated, Validated};
pub use sampler::{
    SampleSink, Sampler, SamplerConfig, SamplerError, SamplerState, SamplerStats, TelemetryRow,
};
#[cfg(feature = "simulation")]
pub use sim::SimulatedCell;
pub use sync::{Activity, CycleSnapshot, StatusExchange};
