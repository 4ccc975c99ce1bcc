//! Interactive REPL-style command-line interface client.

use std::io::{self, Write};

use color_print::{cprint, cprintln};

use ringdht::{ClientCommand, ClientDriver, CommandOutcome, DhtError};

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Recognizable command types.
enum ReplCommand {
    /// Command issued to the ring.
    Normal(ClientCommand),

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Interactive REPL-style client struct.
pub struct ClientRepl {
    /// Ring client driver.
    driver: ClientDriver,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    /// Creates a new REPL-style client.
    pub fn new(driver: ClientDriver) -> Self {
        ClientRepl {
            driver,
            input_buf: String::new(),
        }
    }

    /// Prints the prompt string.
    #[inline]
    fn print_prompt() -> Result<(), DhtError> {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush()?;
        Ok(())
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&DhtError>) {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        println!("HELP: Supported commands are:");
        println!("          put <key> <value>");
        println!("          get <key>");
        println!("          add <endpoint> <id>");
        println!("          remove <id>");
        println!("          end");
        println!("          help");
        println!("          exit");
        println!("      Keys are integers in [1, max_id], values are integers");
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, DhtError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }

        // match case-insensitively
        match &self.input_buf.trim().to_lowercase()[..] {
            "help" => Ok(ReplCommand::PrintHelp),
            "exit" => Ok(ReplCommand::Exit),
            line => match ClientCommand::parse_line(line) {
                Ok(Some(cmd)) => Ok(ReplCommand::Normal(cmd)),
                Ok(None) => Ok(ReplCommand::Nothing),
                Err(e) => {
                    Self::print_help(Some(&e));
                    Err(e)
                }
            },
        }
    }

    /// Prints command execution result.
    fn print_result(
        &self,
        result: Result<CommandOutcome, DhtError>,
    ) -> Result<(), DhtError> {
        match result {
            Ok(CommandOutcome::Done) => {
                cprintln!("<bright-green>✓</> done");
            }

            Ok(CommandOutcome::Value {
                value: Some(value),
                owner,
            }) => {
                cprintln!("<bright-green>✓</> {} <<owner {}>>", value, owner);
            }

            Ok(CommandOutcome::Value { value: None, owner }) => {
                cprintln!("<bright-green>✓</> not found <<owner {}>>", owner);
            }

            Ok(CommandOutcome::Ended) => {
                cprintln!("<bright-blue>#</> ring has been shut down");
            }

            Err(e) => {
                cprintln!("<bright-red>✗</> {}", e);
            }
        }

        io::stdout().flush()?;
        Ok(())
    }

    /// One iteration of the REPL loop. Returns `Ok(false)` when the loop
    /// should stop.
    async fn iter(&mut self) -> Result<bool, DhtError> {
        Self::print_prompt()?;

        let cmd = self.read_command()?;
        match cmd {
            ReplCommand::Exit => {
                println!("Exitting...");
                Ok(false)
            }

            ReplCommand::Nothing => Ok(true),

            ReplCommand::PrintHelp => {
                Self::print_help(None);
                Ok(true)
            }

            ReplCommand::Normal(cmd) => {
                let result = self.driver.execute(cmd).await;
                self.print_result(result)?;
                Ok(!self.driver.ended())
            }
        }
    }

    /// Runs the REPL loop until exit or END. Shuts the ring down on the way
    /// out if not done yet.
    pub async fn run(&mut self) -> Result<(), DhtError> {
        loop {
            if let Ok(false) = self.iter().await {
                break;
            }
        }

        if !self.driver.ended() {
            self.driver.end().await?;
        }
        Ok(())
    }
}
