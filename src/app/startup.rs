use crate::app::cli::args::Args;
use crate::app::commands;
use crate::core::error_handling::log_error_with_context;
use crate::core::logging::init_logging;
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::styles::palette_to_clap;
use crate::core::version::long_version;
use clap::{CommandFactory, FromArgMatches};

/// Parse arguments, set up logging and run the selected command
///
/// Returns the process exit code.
pub fn startup() -> i32 {
    let use_color_help = {
        use std::io::IsTerminal;
        std::io::stdout().is_terminal()
    };
    let matches = Args::command()
        .styles(palette_to_clap(use_color_help))
        .long_version(long_version())
        .get_matches();
    let args = match Args::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(e) => e.exit(),
    };

    let log_file = args.log_file();
    if let Err(e) = init_logging(
        args.log_level.as_deref(),
        args.log_format.as_deref(),
        log_file.as_deref(),
        args.use_color(),
    ) {
        eprintln!("Error initialising logging: {}", e);
        return 1;
    }

    let config = match commands::load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            log_error_with_context(&e, "Loading configuration");
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("FATAL: cannot start async runtime: {}", e);
            return 1;
        }
    };

    runtime.block_on(async {
        let result = ShutdownCoordinator::guard_with_coordinator(|coordinator, _rx| async move {
            commands::run(&args, &config, coordinator).await
        })
        .await;
        match result {
            Ok(code) => code,
            Err(e) => {
                log_error_with_context(&e, "Command failed");
                1
            }
        }
    })
}
