//! Commands over the sandbox filesystem.

use anyhow::{Context, Result};
use nat_wasm_runtime::{FileKind, Runtime};
use std::path::Path;

pub async fn tree(runtime: &Runtime, dir: &str, json: bool) -> Result<()> {
    let files = runtime.list_tree(dir).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }

    println!("{:<6} {:>8}  {}", "Type", "Size", "Path");
    println!("{}", "-".repeat(48));
    for file in &files {
        let kind = match file.kind {
            FileKind::Tree => "tree",
            FileKind::Blob => "blob",
        };
        println!("{:<6} {:>8}  {}", kind, file.content.len(), file.path);
    }
    Ok(())
}

pub async fn ls(runtime: &Runtime, dir: &str, json: bool) -> Result<()> {
    let mut names = runtime.list(dir).await?;
    names.sort();

    if json {
        println!("{}", serde_json::to_string(&names)?);
    } else {
        for name in names {
            println!("{}", name);
        }
    }
    Ok(())
}

pub async fn cat(runtime: &Runtime, path: &str) -> Result<()> {
    let file = runtime.read_file(path).await?;
    print!("{}", file.content);
    Ok(())
}

pub async fn put(runtime: &Runtime, path: &str, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    runtime.write_file(path, &content).await?;
    println!("Wrote {} ({} bytes)", path, content.len());
    Ok(())
}

pub async fn mkdir(runtime: &Runtime, path: &str) -> Result<()> {
    runtime.make_dir(path).await?;
    Ok(())
}

pub async fn rm(runtime: &Runtime, path: &str) -> Result<()> {
    runtime.remove_file(path).await?;
    Ok(())
}
