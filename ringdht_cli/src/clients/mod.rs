//! Client-side utilities for interactive use, scripting, and testing.

mod repl;
pub use repl::ClientRepl;

mod script;
pub use script::ClientScript;

mod tester;
pub use tester::ClientTester;

/// Enum of supported client utility modes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ClientMode {
    Repl,
    Script,
    Tester,
}

impl ClientMode {
    /// Parse command line string into ClientMode enum.
    pub fn parse_name(name: &str) -> Option<Self> {
        match &name.to_lowercase()[..] {
            "repl" => Some(Self::Repl),
            "script" => Some(Self::Script),
            "tester" => Some(Self::Tester),
            _ => None,
        }
    }
}
