//! Script runner client: executes one command per line and prints the
//! result of every GET as `value owner`.

use std::fs;
use std::io::{self, Read, Write};

use serde::Deserialize;

use ringdht::{
    parsed_config, pf_error, pf_info, ClientCommand, ClientDriver,
    CommandOutcome, DhtError,
};

/// Mode parameters struct.
#[derive(Debug, Deserialize)]
pub struct ModeParamsScript {
    /// Path to the script file; reads from stdin if empty.
    pub script_file: String,

    /// Stop at the first failed command instead of carrying on.
    pub stop_on_error: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for ModeParamsScript {
    fn default() -> Self {
        ModeParamsScript {
            script_file: "".into(),
            stop_on_error: false,
        }
    }
}

/// Script runner client struct.
pub struct ClientScript {
    /// Ring client driver.
    driver: ClientDriver,

    /// Mode parameters struct.
    params: ModeParamsScript,
}

impl ClientScript {
    /// Creates a new script runner client.
    pub fn new(
        driver: ClientDriver,
        params_str: Option<&str>,
    ) -> Result<Self, DhtError> {
        let params = parsed_config!(params_str => ModeParamsScript;
                                    script_file, stop_on_error)?;
        Ok(ClientScript { driver, params })
    }

    /// Reads in the whole script text.
    fn read_script(&self) -> Result<String, DhtError> {
        if self.params.script_file.is_empty() {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            Ok(text)
        } else {
            Ok(fs::read_to_string(&self.params.script_file)?)
        }
    }

    /// Executes every line of given script text, writing GET results to
    /// `out`. Returns the number of failed commands.
    async fn run_lines(
        &mut self,
        text: &str,
        out: &mut impl Write,
    ) -> Result<usize, DhtError> {
        let mut num_failed = 0;

        for (lineno, line) in text.lines().enumerate() {
            if self.driver.ended() {
                break;
            }

            let result = match ClientCommand::parse_line(line) {
                Ok(Some(cmd)) => self.driver.execute(cmd).await,
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome @ CommandOutcome::Value { .. }) => {
                    writeln!(out, "{}", outcome)?;
                }
                Ok(_) => {}
                Err(e) => {
                    pf_error!("line {}: '{}' failed: {}", lineno + 1, line, e);
                    num_failed += 1;
                    if self.params.stop_on_error {
                        break;
                    }
                }
            }
        }

        out.flush()?;
        Ok(num_failed)
    }

    /// Runs the script, then shuts the ring down if the script did not.
    pub async fn run(&mut self) -> Result<(), DhtError> {
        let text = self.read_script()?;
        let num_failed = self.run_lines(&text, &mut io::stdout()).await?;

        if !self.driver.ended() {
            self.driver.end().await?;
        }

        if num_failed > 0 {
            if self.params.stop_on_error {
                return Err(DhtError::msg("script stopped at failed command"));
            }
            pf_info!("{} command(s) failed", num_failed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod script_tests {
    use super::*;
    use ringdht::{check_final_state, RingCluster};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn run_basic_script() -> Result<(), DhtError> {
        let (cluster, driver) = RingCluster::new_and_setup(5, None)?;
        let mut script = ClientScript::new(driver, None)?;

        let text = "\
            # scenario lines\n\
            put 9 100\n\
            get 9\n\
            add 2 500\n\
            get 9\n\
            get 42\n\
            remove 1000\n\
            remove 500\n\
            get 9\n\
            end\n\
            get 9\n";
        let mut out = Vec::new();
        let num_failed = script.run_lines(text, &mut out).await?;
        assert_eq!(num_failed, 1);
        assert_eq!(
            String::from_utf8_lossy(&out),
            "100 1000\n100 500\n-1 500\n100 1000\n"
        );

        let exits = cluster.join().await;
        check_final_state(1000, &exits)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_on_error() -> Result<(), DhtError> {
        let (cluster, driver) = RingCluster::new_and_setup(5, None)?;
        let mut script =
            ClientScript::new(driver, Some("stop_on_error = true"))?;

        let mut out = Vec::new();
        let text = "get 5\nbogus 1\nget 6\n";
        assert_eq!(script.run_lines(text, &mut out).await?, 1);
        assert_eq!(String::from_utf8_lossy(&out), "-1 1000\n");

        script.driver.end().await?;
        let exits = cluster.join().await;
        assert!(exits.iter().all(|exit| exit.success()));
        Ok(())
    }
}
