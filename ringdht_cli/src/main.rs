//! Ringdht command-line executable.

use std::process::ExitCode;

use clap::Parser;

use tokio::runtime::Builder;

use ringdht::{
    check_final_state, logger_init, pf_error, pf_info, pf_warn, DhtError,
    EndpointId, RingCluster,
};

mod clients;

use crate::clients::{ClientMode, ClientRepl, ClientScript, ClientTester};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client utility mode to run: repl|script|tester.
    #[arg(short, long)]
    utility: String,

    /// Total number of endpoints: head, joinable nodes, tail, and client.
    #[arg(short, long, default_value_t = 5)]
    population: EndpointId,

    /// Ring configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Mode-specific client parameters TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    params: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(mode)` on success or
    /// `Err(DhtError)` on any error.
    fn sanitize(&self) -> Result<ClientMode, DhtError> {
        if self.threads < 2 {
            Err(DhtError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if self.population < 3 {
            Err(DhtError::msg(format!(
                "invalid population {}, need at least 3",
                self.population
            )))
        } else {
            ClientMode::parse_name(&self.utility).ok_or(DhtError::msg(
                format!("utility mode '{}' unrecognized", self.utility),
            ))
        }
    }
}

/// Actual main function of ringdht executable.
fn client_main() -> Result<(), DhtError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let mode = args.sanitize()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(args.config.clone())
    };

    // parse optional params string if given
    let params_str = if args.params.is_empty() {
        None
    } else {
        args.params = args.params.replace('+', "\n");
        Some(args.params.clone())
    };

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-ring")
        .build()?;

    // enter tokio runtime, launch the ring, and do work
    runtime.block_on(async move {
        match mode {
            ClientMode::Tester => {
                // every test case launches a fresh ring of its own
                let mut tester = ClientTester::new(
                    args.population,
                    config_str,
                    params_str.as_deref(),
                )?;
                tester.run().await
            }

            ClientMode::Repl | ClientMode::Script => {
                let (cluster, driver) = RingCluster::new_and_setup(
                    args.population,
                    config_str.as_deref(),
                )?;
                let max_id = cluster.config().max_id;

                if mode == ClientMode::Repl {
                    // run interactive REPL loop
                    let mut repl = ClientRepl::new(driver);
                    repl.run().await?;
                } else {
                    // run commands from a script
                    let mut script =
                        ClientScript::new(driver, params_str.as_deref())?;
                    script.run().await?;
                }

                // every endpoint has been told to end at this point
                let exits = cluster.join().await;
                check_final_state(max_id, &exits)?;
                pf_info!("{} storage endpoints exited cleanly", exits.len());
                Ok::<(), DhtError>(()) // give type hint for this async block
            }
        }
    })
}

/// Main function of ringdht executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exitted: {}", e);
        ExitCode::FAILURE
    } else {
        pf_warn!("client_main exitted successfully");
        ExitCode::SUCCESS
    }
}
