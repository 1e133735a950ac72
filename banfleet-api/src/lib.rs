//! Generated gRPC bindings for the banfleet control plane.
//!
//! Two surfaces: the orchestrator services consumed by operators and
//! agents (`orch.v1.*`), and the per-agent lifecycle service driven by
//! the orchestrator's node controller (`agent.v1.control`).

pub mod orch {
    pub mod v1 {
        pub mod control {
            tonic::include_proto!("orch.v1.control");
        }
        pub mod report {
            tonic::include_proto!("orch.v1.report");
        }
        pub mod rule {
            tonic::include_proto!("orch.v1.rule");
        }
        pub mod strategy {
            tonic::include_proto!("orch.v1.strategy");
        }
        pub mod orch {
            tonic::include_proto!("orch.v1.orch");
        }
        pub mod auth {
            tonic::include_proto!("orch.v1.auth");
        }
    }
}

pub mod agent {
    pub mod v1 {
        pub mod control {
            tonic::include_proto!("agent.v1.control");
        }
    }
}

impl orch::v1::report::Phase {
    /// The string form stored in agent status records.
    pub fn as_status_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
        }
    }

    /// Inverse of [`Phase::as_status_str`]; unknown strings map to `Ready`.
    pub fn from_status_str(s: &str) -> Self {
        match s {
            "Running" => Self::Running,
            "Stopped" => Self::Stopped,
            _ => Self::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::orch::v1::report::Phase;

    #[test]
    fn phase_round_trips_through_status_strings() {
        for phase in [Phase::Ready, Phase::Running, Phase::Stopped] {
            assert_eq!(Phase::from_status_str(phase.as_status_str()), phase);
        }
    }

    #[test]
    fn unknown_phase_string_defaults_to_ready() {
        assert_eq!(Phase::from_status_str("Bogus"), Phase::Ready);
    }
}
