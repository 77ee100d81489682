//! Main entry point for the strongbox CLI app

use serde_json::Value;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use strongbox::cli::{self, Commands};
use strongbox::{index, Probe, PropertyMap, Safe, PROP_ID, PROP_NAME};

fn main() -> std::process::ExitCode {
    if let Err(e) = run_app() {
        // Help and version output go through clap's own printer and exit code.
        if let Some(clap_err) = e.downcast_ref::<clap::Error>() {
            clap_err.exit();
        }
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let command = cli::run()?;
    let probe = Probe::new();

    match command {
        Commands::Create { safe, password } => {
            let pass = cli::get_password(password)?;
            let created = Safe::create(&safe, &pass, PropertyMap::new(), PropertyMap::new())?;
            println!("Created {}", created.path().display());
        }

        Commands::Add { safe, input, dest, meta, password } => {
            let pass = cli::get_password(password)?;
            let opened = Safe::open(&safe, &pass)?;

            let dest = dest.unwrap_or_else(|| {
                let name = input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("/{}", name)
            });
            let mut properties = PropertyMap::new();
            properties.insert(PROP_ID.into(), Value::String(dest.clone()));
            properties.insert(
                PROP_NAME.into(),
                Value::String(index::leaf_name(&dest).to_string()),
            );
            for entry in &meta {
                let (key, value) = entry
                    .split_once('=')
                    .ok_or_else(|| format!("bad --meta entry '{}', expected key=value", entry))?;
                properties.insert(key.to_string(), Value::String(value.to_string()));
            }

            let mut reader = File::open(&input)?;
            let stored = opened.add(properties, &mut reader, &probe)?;
            opened.save(&probe)?;
            println!("Added {}", stored);
        }

        Commands::Extract { safe, path, output, password } => {
            let pass = cli::get_password(password)?;
            let opened = Safe::open(&safe, &pass)?;

            let out_path = output.unwrap_or_else(|| PathBuf::from(index::leaf_name(&path)));
            let mut out = File::create(&out_path)?;
            let bytes = opened.extract(&path, &mut out, &probe)?;
            out.flush()?;
            println!("Extracted {} bytes to {}", bytes, out_path.display());
        }

        Commands::Delete { safe, path, force, password } => {
            let pass = cli::get_password(password)?;
            let opened = Safe::open(&safe, &pass)?;

            if opened.contains(&path) {
                opened.delete(&path)?;
            } else {
                opened.delete_folder(&path, force)?;
            }
            opened.save(&probe)?;
            println!("Deleted {}", path);
        }

        Commands::List { safe, pattern, password } => {
            let pass = cli::get_password(password)?;
            let opened = Safe::open(&safe, &pass)?;

            let paths = match pattern {
                Some(pattern) => opened.glob(&pattern)?,
                None => opened.record_paths(),
            };
            for path in &paths {
                println!("{}", path);
            }
            println!("{} entries", paths.len());
        }

        Commands::Metadata { safe, path, password } => {
            let pass = cli::get_password(password)?;
            let opened = Safe::open(&safe, &pass)?;
            let metadata = opened.read_metadata(&path)?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(metadata))?);
        }

        Commands::Verify { safe, password } => {
            let pass = cli::get_password(password)?;
            let opened = Safe::open(&safe, &pass)?;
            if opened.verify(&probe)? {
                println!("OK: integrity hash matches.");
            } else {
                println!("WARNING: integrity hash mismatch, the safe may be corrupted or tampered with.");
            }
        }
    }

    Ok(())
}
