//! Command-line entry point: flags, registration generation and the
//! init-start-wait-stop sequence, mapped to process exit codes.

use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::Parser;

use crate::config::Config;
use crate::error::{GenerateError, InitError};
use crate::logging::init_logging;
use crate::signals::wait_for_shutdown_signal;
use crate::supervisor::{Bridge, Dependencies};

#[derive(Parser, Debug)]
#[command(name = "wa-bridge", version, about = "A Matrix-WhatsApp puppeting bridge")]
pub struct Args {
    /// The path to the config file
    #[arg(short, long, default_value = "config.yaml", env = "BRIDGE_CONFIG")]
    pub config: PathBuf,

    /// The path where to save the appservice registration
    #[arg(short, long, default_value = "registration.yaml", env = "BRIDGE_REGISTRATION")]
    pub registration: PathBuf,

    /// Generate registration and quit
    #[arg(short, long)]
    pub generate_registration: bool,
}

/// Exit code for a flag-parsing outcome: help and version output are a
/// normal exit, anything else is a usage error.
pub fn parse_exit_code(error: &clap::Error) -> i32 {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

/// Create tokens, write the registration file, then save the config with
/// the tokens in it.
pub fn generate_registration(
    config: &mut Config,
    config_path: &Path,
    registration_path: &Path,
) -> Result<(), GenerateError> {
    let registration = config
        .new_registration()
        .map_err(GenerateError::Generate)?;
    registration
        .save(registration_path)
        .map_err(GenerateError::SaveRegistration)?;
    config.save(config_path).map_err(GenerateError::SaveConfig)?;
    Ok(())
}

/// Run the bridge and return the process exit code.
pub async fn run(args: Args) -> i32 {
    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            let e = InitError::Config(e);
            eprintln!("{e}");
            return e.exit_code();
        }
    };

    if args.generate_registration {
        return match generate_registration(&mut config, &args.config, &args.registration) {
            Ok(()) => {
                println!(
                    "Registration generated. Add the path to the registration file to your Synapse config and restart it, then start the bridge."
                );
                0
            }
            Err(e) => {
                eprintln!("{e}");
                e.exit_code()
            }
        };
    }

    let settings = match config.make_app_service() {
        Ok(settings) => settings,
        Err(e) => {
            let e = InitError::AppService(e);
            eprintln!("{e}");
            return e.exit_code();
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        let e = InitError::Logging(e);
        eprintln!("{e}");
        return e.exit_code();
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Initializing bridge");
    let deps = Dependencies::from_config(&config, &settings);
    let bridge = match Bridge::init(config, settings, deps) {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!(error = %e, "Initialization failed");
            eprintln!("{e}");
            return e.exit_code();
        }
    };

    let shutdown = async {
        match wait_for_shutdown_signal().await {
            Ok(signal) => tracing::info!(signal, "Interrupt received, stopping"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers, waiting for Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };

    match bridge.run_until(shutdown).await {
        Ok(report) => {
            for step in report.failures() {
                tracing::warn!(step = ?step, "Shutdown step did not complete");
            }
        }
        Err(e) => tracing::error!(error = %e, "Bridge lifecycle error"),
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["wa-bridge"]).unwrap();
        assert!(!args.generate_registration);
        assert_eq!(args.registration, PathBuf::from("registration.yaml"));
    }

    #[test]
    fn test_short_flags() {
        let args =
            Args::try_parse_from(["wa-bridge", "-c", "/etc/bridge.yaml", "-r", "/tmp/reg.yaml", "-g"])
                .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/bridge.yaml"));
        assert_eq!(args.registration, PathBuf::from("/tmp/reg.yaml"));
        assert!(args.generate_registration);
    }

    #[test]
    fn test_unknown_flag_is_an_error() {
        assert!(Args::try_parse_from(["wa-bridge", "--bogus"]).is_err());
    }

    #[test]
    fn test_parse_exit_codes() {
        let code = |argv: &[&str]| parse_exit_code(&Args::try_parse_from(argv).unwrap_err());
        assert_eq!(code(&["wa-bridge", "--help"]), 0);
        assert_eq!(code(&["wa-bridge", "-h"]), 0);
        assert_eq!(code(&["wa-bridge", "--version"]), 0);
        assert_eq!(code(&["wa-bridge", "--bogus"]), 1);
        assert_eq!(code(&["wa-bridge", "-c"]), 1);
    }
}
