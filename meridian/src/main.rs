use std::process::ExitCode;

use anyhow::Result;
use clap::{Error as ClapError, Parser as _};
use log::error;

use crate::args::MeridianArgs;

mod args;
mod commands;

fn main() -> ExitCode {
    if let Err(error) = try_main() {
        error.downcast_ref().map(ClapError::exit);
        error!("{error:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn try_main() -> Result<()> {
    let args = MeridianArgs::try_parse()?;

    binary_utils::initialize_logger(module_path!())?;
    binary_utils::initialize_task_pool(args.num_threads())?;

    args.run()
}
