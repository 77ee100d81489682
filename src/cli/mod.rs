use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create a new, empty safe.
    #[command(alias = "c")]
    Create {
        /// The path for the new safe file (e.g. vault.sbx).
        #[arg(required = true)]
        safe: PathBuf,

        /// The password protecting the safe. If not provided, will try STRONGBOX_PASSWORD or prompt interactively.
        #[arg(long)]
        password: Option<String>,
    },

    /// Add a file to the safe and save it.
    #[command(alias = "a")]
    Add {
        /// The safe file to modify.
        #[arg(required = true)]
        safe: PathBuf,

        /// The local file whose bytes will be stored.
        #[arg(required = true)]
        input: PathBuf,

        /// Destination path inside the safe (e.g. /docs/notes.txt).
        /// Defaults to the input file name under the root.
        #[arg(short, long)]
        dest: Option<String>,

        /// Additional metadata entries, as key=value pairs.
        #[arg(short, long = "meta")]
        meta: Vec<String>,

        #[arg(long)]
        password: Option<String>,
    },

    /// Extract one stored file.
    #[command(alias = "x")]
    Extract {
        /// The safe file to read.
        #[arg(required = true)]
        safe: PathBuf,

        /// Path of the stored file inside the safe.
        #[arg(required = true)]
        path: String,

        /// Where to write the extracted bytes. Defaults to the stored
        /// file's name in the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        password: Option<String>,
    },

    /// Delete a stored file (or an empty directory) and save the safe.
    #[command(alias = "d")]
    Delete {
        /// The safe file to modify.
        #[arg(required = true)]
        safe: PathBuf,

        /// Path of the stored file or directory inside the safe.
        #[arg(required = true)]
        path: String,

        /// Delete a directory even when it still contains files.
        #[arg(long)]
        force: bool,

        #[arg(long)]
        password: Option<String>,
    },

    /// List the contents of a safe without extracting anything.
    #[command(alias = "l")]
    List {
        /// The safe file to list.
        #[arg(required = true)]
        safe: PathBuf,

        /// Wildcard pattern to match (e.g. "/docs/*"). Lists everything by default.
        pattern: Option<String>,

        #[arg(long)]
        password: Option<String>,
    },

    /// Show the stored metadata of one file.
    #[command(alias = "m")]
    Metadata {
        /// The safe file to read.
        #[arg(required = true)]
        safe: PathBuf,

        /// Path of the stored file inside the safe.
        #[arg(required = true)]
        path: String,

        #[arg(long)]
        password: Option<String>,
    },

    /// Recompute the integrity hash and compare it with the stored one.
    #[command(alias = "v")]
    Verify {
        /// The safe file to check.
        #[arg(required = true)]
        safe: PathBuf,

        #[arg(long)]
        password: Option<String>,
    },
}

/// Gets the password from the command-line option, the `STRONGBOX_PASSWORD`
/// environment variable, or an interactive prompt.
///
/// Priority:
/// 1. `--password` command-line argument.
/// 2. `STRONGBOX_PASSWORD` environment variable.
/// 3. Interactive prompt (hidden input).
pub fn get_password(password_opt: Option<String>) -> Result<String, std::io::Error> {
    if let Some(pass) = password_opt {
        return Ok(pass);
    }
    if let Ok(pass) = std::env::var("STRONGBOX_PASSWORD") {
        return Ok(pass);
    }
    rpassword::prompt_password("Password: ")
}

/// Parses command-line arguments using `clap` and returns the command to execute.
pub fn run() -> Result<Commands, Box<dyn std::error::Error>> {
    let args = Args::try_parse()?;
    Ok(args.command)
}
