use rustyline::{Config, Editor, Result};

/// Prompt shown before each input line, prefixed with the signed-in user's name.
pub fn generate_prompt(user: Option<&str>) -> String {
    match user {
        Some(name) => format!("{}> ", name),
        None => "> ".to_string(),
    }
}

pub fn rl() -> Result<Editor<()>> {
    let config = Config::builder()
        .history_ignore_space(true)
        .build();
    Editor::with_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_user_name() {
        assert_eq!(generate_prompt(None), "> ");
        assert_eq!(generate_prompt(Some("Ada")), "Ada> ");
    }
}
