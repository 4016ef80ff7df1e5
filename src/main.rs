use clap::Parser;

mod cli;
mod commands;

use cli::{Cli, Commands};
use decomp_prep::logging::init_logging;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Prepare {
            fits,
            target,
            pos_type,
            hdu,
            materials,
            psf,
            output,
            plot,
            format,
        } => {
            commands::prepare(
                &commands::PrepareOptions {
                    fits: &fits,
                    hdu,
                    target,
                    pos_type: &pos_type,
                    materials: &materials,
                    psf: &psf,
                    output: &output,
                    plot,
                    format: &format,
                },
                &config,
            )?;
        }
        Commands::FindPsf {
            fits,
            hdu,
            radius,
            interactive,
            output,
            format,
        } => {
            commands::find_psf(
                &fits,
                hdu,
                radius,
                interactive,
                output.as_deref(),
                &format,
                &config,
            )?;
        }
        Commands::Inspect { fits, hdu, format } => {
            commands::inspect(&fits, hdu, &format)?;
        }
    }

    Ok(())
}
