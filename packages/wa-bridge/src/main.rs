//! wa-bridge binary.
//!
//! ```text
//! wa-bridge [-c config.yaml] [-r registration.yaml] [-g]
//! ```
//!
//! Exit codes: 0 on a normal stop, 1 on bad flags, 10-16 when
//! initialization fails and 20-22 when generating a registration fails.

use clap::Parser;

use wa_bridge::cli::{parse_exit_code, run, Args};

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(parse_exit_code(&e));
        }
    };

    std::process::exit(run(args).await);
}
