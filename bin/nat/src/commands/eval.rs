//! Commands that call into the VM.

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use nat_wasm_runtime::{Payload, Response, Runtime};
use std::path::Path;

pub async fn interpret(runtime: &Runtime, path: &str, json: bool) -> Result<()> {
    let response = runtime
        .interpret(path)
        .await
        .with_context(|| format!("Failed to interpret {}", path))?;
    print_response(&response, json)?;

    if !response.success {
        bail!("Interpretation of {} failed", path);
    }
    Ok(())
}

pub async fn generate(runtime: &Runtime, path: &str, init: bool, json: bool) -> Result<()> {
    if init {
        runtime.init().await.context("Failed to reset the VM")?;
    }

    let mut stream = Box::pin(runtime.generate(path).into_stream());
    let mut count = 0usize;
    while let Some(item) = stream.next().await {
        let response = item.with_context(|| format!("Generation of {} failed", path))?;
        if response.is_generation_start() {
            continue;
        }
        print_response(&response, json)?;
        count += 1;
    }

    tracing::debug!(path, count, "Generation finished");
    Ok(())
}

pub async fn typeset(runtime: &Runtime, path: &str, json: bool) -> Result<()> {
    let typeset = runtime
        .typeset(path)
        .await
        .with_context(|| format!("Failed to typeset {}", path))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&typeset)?);
    } else {
        println!("{}", typeset.tex);
    }

    if !typeset.success {
        bail!("Typesetting of {} failed", path);
    }
    Ok(())
}

pub async fn compile(runtime: &Runtime, path: &str, source: &Path, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;

    match runtime.compile(path, &text).await? {
        Some(response) => print_response(&response, json),
        None => {
            for line in runtime.take_errors() {
                eprintln!("{}", line);
            }
            bail!("Compilation of {} failed", path)
        }
    }
}

fn print_response(response: &Response, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(response)?);
        return Ok(());
    }

    match &response.out {
        Payload::Flag(s) | Payload::Tex(s) | Payload::String(s) => println!("{}", s),
        Payload::Codeblock { text } => println!("```\n{}\n```", text),
        Payload::Anchor { title, tex, path } => println!("[{}]({}) {}", title, path, tex),
    }
    Ok(())
}
