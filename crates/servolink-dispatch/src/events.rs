/// Operator command delivered to the orchestrator, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeEvent {
    /// Switch to a teleop provider; the alias may be an orchestrator-side
    /// mnemonic.
    Teleop { alias: String },
    /// Store an AI instruction and switch to the AI provider.
    Infer { instruction: String },
    /// Switch to the idle provider.
    Idle { reason: Option<String> },
    /// Control command for the data-collection provider.
    Data { command: String },
    /// Begin the cooperative shutdown handshake.
    Shutdown { reason: Option<String> },
}
