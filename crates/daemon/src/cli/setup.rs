//! Interactive provider configuration: `tenex setup`.

use std::path::Path;

use rustyline::DefaultEditor;

use tenex_domain::config::{Config, ProviderConfig};
use tenex_domain::{Error, Result};

use super::save_config;

fn prompt_with_default(editor: &mut DefaultEditor, prompt: &str, default: &str) -> Result<String> {
    let line = editor
        .readline(&format!("{prompt} [{default}]: "))
        .map_err(|e| Error::Config(format!("input aborted: {e}")))?;
    let line = line.trim();
    Ok(if line.is_empty() {
        default.to_string()
    } else {
        line.to_string()
    })
}

/// Walk the user through one provider entry and persist the result.
pub fn run(mut config: Config, config_path: &Path) -> Result<()> {
    println!("TENEX provider setup — values are written to {}", config_path.display());

    let mut editor =
        DefaultEditor::new().map_err(|e| Error::Config(format!("terminal: {e}")))?;

    let slug = prompt_with_default(&mut editor, "Config slug", "default")?;
    let base_url = prompt_with_default(
        &mut editor,
        "OpenAI-compatible base URL",
        "https://api.openai.com/v1",
    )?;
    let model = prompt_with_default(&mut editor, "Model", "gpt-4o")?;
    let api_key_env = prompt_with_default(
        &mut editor,
        "Environment variable holding the API key (empty to store inline)",
        "OPENAI_API_KEY",
    )?;

    let api_key = if api_key_env.is_empty() {
        let key = rpassword::prompt_password("API key (stored in the config file): ")
            .map_err(|e| Error::Config(format!("input aborted: {e}")))?;
        Some(key)
    } else {
        None
    };

    config.llm.configs.insert(
        slug.clone(),
        ProviderConfig {
            base_url,
            model,
            api_key_env: (!api_key_env.is_empty()).then_some(api_key_env),
            api_key,
            temperature: None,
            max_tokens: None,
        },
    );
    if config.llm.default.is_none() {
        config.llm.default = Some(slug.clone());
    }

    save_config(&config, config_path)?;
    println!("Saved provider '{slug}'.");
    Ok(())
}
