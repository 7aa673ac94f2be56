use std::path::{Path, PathBuf};

use anyhow::Result;

use rapidpipe_engine::PipeCommand;

use super::{load_config, open_quarantine_store};

/// Execute the `check` command: validate the pipe config, the command, and
/// the quarantine store.
pub fn execute(pipe_path: &Path) -> Result<()> {
    let config = load_config(pipe_path)?;
    println!("Pipe structure:    OK");

    let command = config.pipe_command()?;
    let command_ok = match find_program(&command) {
        Some(path) => {
            println!("Command:           OK ({})", path.display());
            true
        }
        None => {
            println!("Command:           NOT FOUND");
            println!("  `{}` is not an executable on PATH", command.program());
            false
        }
    };

    let quarantine_ok = match &config.quarantine {
        None => {
            println!("Quarantine store:  not configured");
            true
        }
        Some(quarantine) => match open_quarantine_store(quarantine) {
            Ok(_) => {
                println!("Quarantine store:  OK ({})", quarantine.path.display());
                true
            }
            Err(e) => {
                println!("Quarantine store:  FAILED");
                println!("  {e:#}");
                false
            }
        },
    };

    if command_ok && quarantine_ok {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

/// Resolve the command's program the way `execvp` would.
fn find_program(command: &PipeCommand) -> Option<PathBuf> {
    let program = Path::new(command.program());
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
