use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context};
use coffer_sdk::{Coffer, CofferConfig, ContentRangeRequest, ContentReference, KeyInfo, WrappingKeyId};
use colored::Colorize;
use serde_json::json;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    let config = cli.config.as_path();
    match cli.command {
        Command::InitConfig(args) => cmd_init_config(config, &args),
        Command::Put(args) => cmd_put(&open(config)?, args, &format),
        Command::Get(args) => cmd_get(&open(config)?, args, &format),
        Command::Stat(args) => cmd_stat(&open(config)?, args, &format),
        Command::Rm(args) => cmd_rm(&open(config)?, args, &format),
        Command::Keys(args) => cmd_keys(&open(config)?, args, &format),
        Command::Rewrap(args) => cmd_rewrap(&open(config)?, args, &format),
        Command::Revoke(args) => cmd_revoke(&open(config)?, args, &format),
    }
}

fn open(path: &Path) -> anyhow::Result<Coffer> {
    let config = CofferConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    Ok(Coffer::open(&config)?)
}

fn parse_reference(text: &str) -> anyhow::Result<ContentReference> {
    ContentReference::parse(text).with_context(|| format!("bad reference {text:?}"))
}

fn print_json(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn keys_json(keys: &[KeyInfo]) -> serde_json::Value {
    keys.iter()
        .map(|k| {
            json!({
                "wrapping_key_id": k.wrapping_key_id.as_str(),
                "algorithm": k.algorithm.as_str(),
                "decryptable": k.decryptable,
            })
        })
        .collect()
}

fn print_keys(keys: &[KeyInfo]) {
    if keys.is_empty() {
        println!("  {}", "no key rows (stored in the clear)".dimmed());
    }
    for k in keys {
        let mark = if k.decryptable { "✓".green() } else { "✗".red() };
        println!("  {} {} ({})", mark, k.wrapping_key_id.to_string().yellow(), k.algorithm.as_str());
    }
}

fn cmd_init_config(path: &Path, args: &InitConfigArgs) -> anyhow::Result<()> {
    if path.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = CofferConfig::generated(&args.root)?;
    std::fs::write(path, config.to_toml_string()?)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("{} Wrote {}", "✓".green().bold(), path.display().to_string().bold());
    println!("  Content: {}", config.store.root.display());
    println!("  {}", "Keep the wrapping key secret: losing it loses the content.".yellow());
    Ok(())
}

fn cmd_put(coffer: &Coffer, args: PutArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let stored = if args.file == Path::new("-") {
        coffer.put(&mut io::stdin().lock())?
    } else {
        let mut file = File::open(&args.file)
            .with_context(|| format!("opening {}", args.file.display()))?;
        coffer.put(&mut file)?
    };

    match format {
        OutputFormat::Json => print_json(json!({
            "reference": stored.reference.as_str(),
            "size": stored.size,
            "encrypted": coffer.is_encrypted(),
        })),
        OutputFormat::Text => {
            println!("{} Stored {} bytes", "✓".green().bold(), stored.size);
            println!("{}", stored.reference.as_str().yellow());
            Ok(())
        }
    }
}

fn cmd_get(coffer: &Coffer, args: GetArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let reference = parse_reference(&args.reference)?;
    let request = match &args.range {
        Some(text) => text
            .parse::<ContentRangeRequest>()
            .with_context(|| format!("bad range {text:?}"))?,
        None => ContentRangeRequest::full(),
    };

    let range = match &args.output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut out = BufWriter::new(file);
            let range = coffer.read_to(&reference, &request, &mut out)?;
            out.flush()?;
            range
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let range = coffer.read_to(&reference, &request, &mut out)?;
            out.flush()?;
            range
        }
    };

    // Without -o the content itself is on stdout.
    if let Some(path) = &args.output {
        match format {
            OutputFormat::Json => print_json(json!({
                "reference": reference.as_str(),
                "range": range.map(|r| r.to_string()),
                "output": path.display().to_string(),
            }))?,
            OutputFormat::Text => match range {
                Some(r) => println!("{} Wrote {} to {}", "✓".green().bold(), r, path.display()),
                None => println!("{} Content is empty, wrote {}", "✓".green().bold(), path.display()),
            },
        }
    }
    Ok(())
}

fn cmd_stat(coffer: &Coffer, args: RefArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let reference = parse_reference(&args.reference)?;
    let size = coffer.content_size(&reference)?;
    let keys = if coffer.is_encrypted() {
        Some(coffer.describe_keys(&reference)?)
    } else {
        None
    };

    match format {
        OutputFormat::Json => print_json(json!({
            "reference": reference.as_str(),
            "size": size,
            "keys": keys.as_deref().map(keys_json),
        })),
        OutputFormat::Text => {
            println!("Reference: {}", reference.as_str().yellow());
            println!("Size: {} bytes", size.to_string().bold());
            match keys {
                Some(keys) => {
                    println!("Keys:");
                    print_keys(&keys);
                }
                None => println!("Encryption: {}", "disabled".dimmed()),
            }
            Ok(())
        }
    }
}

fn cmd_rm(coffer: &Coffer, args: RefArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let reference = parse_reference(&args.reference)?;
    coffer.remove(&reference)?;
    match format {
        OutputFormat::Json => print_json(json!({ "removed": reference.as_str() })),
        OutputFormat::Text => {
            println!("{} Removed {}", "✓".green().bold(), reference.as_str().yellow());
            Ok(())
        }
    }
}

fn cmd_keys(coffer: &Coffer, args: RefArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let reference = parse_reference(&args.reference)?;
    let keys = coffer.describe_keys(&reference)?;
    match format {
        OutputFormat::Json => print_json(keys_json(&keys)),
        OutputFormat::Text => {
            println!("Key rows for {}", reference.as_str().yellow());
            print_keys(&keys);
            Ok(())
        }
    }
}

fn cmd_rewrap(coffer: &Coffer, args: RefArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let reference = parse_reference(&args.reference)?;
    let added = coffer.rewrap(&reference)?;
    match format {
        OutputFormat::Json => print_json(json!({
            "reference": reference.as_str(),
            "added": added.iter().map(WrappingKeyId::as_str).collect::<Vec<_>>(),
        })),
        OutputFormat::Text => {
            if added.is_empty() {
                println!("Every encrypting key already has a row.");
            }
            for id in &added {
                println!("  {} {}", "added:".green(), id.to_string().yellow());
            }
            Ok(())
        }
    }
}

fn cmd_revoke(coffer: &Coffer, args: RevokeArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let reference = parse_reference(&args.reference)?;
    let id = WrappingKeyId::new(args.wrapping_key_id);
    let removed = coffer.revoke_wrapping_key(&reference, &id)?;
    match format {
        OutputFormat::Json => print_json(json!({
            "reference": reference.as_str(),
            "wrapping_key_id": id.as_str(),
            "removed": removed,
        })),
        OutputFormat::Text => {
            if removed {
                println!("{} Revoked {}", "✓".green().bold(), id.to_string().yellow());
            } else {
                println!("No row for {}", id.to_string().yellow());
            }
            Ok(())
        }
    }
}
