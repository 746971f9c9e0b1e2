//! Pull scenarios exercised by the harness.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// One producer, one consumer, two fixed particles
    SingleParticle,

    /// Three producers each holding a unit cube of particles
    UnionOfCubes,

    /// Garbage on the rendezvous socket before a real attachment
    MalformedRendezvous,

    /// Repeated pulls over one reused group channel
    Reconnect,

    /// More blocks than consumer workers, with ghost copies
    MultiBlock,

    /// Blocking first pull followed by background polling
    BackgroundPoll,

    /// Moving particles pulled across several timesteps
    RandomWalk,

    /// Every link severed between pulls
    SeverAndRecover,

    /// The first group-channel handshake is refused
    RefusedHandshake,

    /// Producers without particles
    EmptyWorld,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SingleParticle,
            ScenarioId::UnionOfCubes,
            ScenarioId::MalformedRendezvous,
            ScenarioId::Reconnect,
            ScenarioId::MultiBlock,
            ScenarioId::BackgroundPoll,
            ScenarioId::RandomWalk,
            ScenarioId::SeverAndRecover,
            ScenarioId::RefusedHandshake,
            ScenarioId::EmptyWorld,
        ]
    }

    /// Scenarios that inject a fault.
    pub fn faults() -> Vec<ScenarioId> {
        Self::all().into_iter().filter(ScenarioId::injects_fault).collect()
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SingleParticle => "single_particle",
            ScenarioId::UnionOfCubes => "union_of_cubes",
            ScenarioId::MalformedRendezvous => "malformed_rendezvous",
            ScenarioId::Reconnect => "reconnect",
            ScenarioId::MultiBlock => "multi_block",
            ScenarioId::BackgroundPoll => "background_poll",
            ScenarioId::RandomWalk => "random_walk",
            ScenarioId::SeverAndRecover => "sever_and_recover",
            ScenarioId::RefusedHandshake => "refused_handshake",
            ScenarioId::EmptyWorld => "empty_world",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SingleParticle => "1 producer, 1 consumer, query returns exactly the particle at the origin",
            ScenarioId::UnionOfCubes => "3 producers x 100 particles in disjoint cubes, one union query returns exactly 300",
            ScenarioId::MalformedRendezvous => "oversized and truncated port names are dropped, the next attachment is served",
            ScenarioId::Reconnect => "3 pulls reuse one client slot and one handshake",
            ScenarioId::MultiBlock => "4x2x1 blocks over 3 consumers, ghost copies counted separately",
            ScenarioId::BackgroundPoll => "poller publishes new snapshots, stop hands the client back",
            ScenarioId::RandomWalk => "moving particles, every pull accounts for every particle",
            ScenarioId::SeverAndRecover => "severed links fail one pull on both sides, the next pull re-attaches",
            ScenarioId::RefusedHandshake => "refused connect abandons the attachment, retry succeeds",
            ScenarioId::EmptyWorld => "no particles anywhere, first pull reports an empty dataset",
        }
    }

    /// Returns true if the scenario injects a fault.
    pub fn injects_fault(&self) -> bool {
        matches!(
            self,
            ScenarioId::MalformedRendezvous | ScenarioId::SeverAndRecover | ScenarioId::RefusedHandshake
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_lowercase().replace('-', "_");
        ScenarioId::all()
            .into_iter()
            .find(|id| id.name() == wanted || id.name().replace('_', "") == wanted)
            .ok_or_else(|| format!("Unknown scenario: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>().unwrap(), id);
            assert!(!id.description().is_empty());
        }
    }

    #[test]
    fn test_aliases() {
        assert_eq!("Sever-And-Recover".parse::<ScenarioId>().unwrap(), ScenarioId::SeverAndRecover);
        assert_eq!("randomwalk".parse::<ScenarioId>().unwrap(), ScenarioId::RandomWalk);
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_fault_scenarios() {
        assert_eq!(ScenarioId::faults().len(), 3);
        assert!(!ScenarioId::SingleParticle.injects_fault());
    }
}
