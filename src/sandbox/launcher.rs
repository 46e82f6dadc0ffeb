use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use crate::agents::{AgentDef, PromptMode};
use crate::config::TmuxConfPolicy;
use crate::util::fs::atomic_write;

/// Launcher configuration read by the in-instance entrypoint from
/// `/yoloai/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    pub agent_command: String,
    /// `interactive` pastes the prompt file; `headless` means the prompt is
    /// already baked into the command and the paste step is skipped.
    pub prompt_mode: String,
    pub startup_delay: f64,
    pub ready_pattern: String,
    /// Space-separated tmux key names.
    pub submit_sequence: String,
    /// `default`, `host`, `default+host`, or `none`.
    pub tmux_conf: String,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir_name: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_domains: Vec<String>,
}

impl LauncherConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Other(format!("serialize launcher config: {e}")))?;
        json.push(b'\n');
        atomic_write(path, &json).map_err(|e| Error::io("write config.json", e))
    }
}

/// Everything needed to compose the launcher config for one sandbox.
pub struct LaunchPlan {
    pub config: LauncherConfig,
    /// Whether the prompt is delivered by pasting into the tmux session
    /// (interactive mode). Headless delivery bakes the prompt into the
    /// command instead, and the paste step is skipped.
    pub paste_prompt: bool,
}

/// Build the agent command and launcher config.
///
/// Headless prompt mode substitutes the shell-quoted prompt for the literal
/// `PROMPT` placeholder in the headless template; otherwise the interactive
/// template runs and the prompt (if any) is pasted by the entrypoint.
pub fn compose(
    agent: &AgentDef,
    model: Option<&str>,
    prompt: Option<&str>,
    working_dir: &Path,
    tmux_policy: TmuxConfPolicy,
    host_identity: Option<(u32, u32)>,
    debug: bool,
    allowed_domains: Vec<String>,
) -> LaunchPlan {
    let headless = prompt.is_some() && agent.prompt_mode == PromptMode::Headless;
    let mut command = if headless {
        let quoted = shell_words::quote(prompt.unwrap_or_default()).into_owned();
        agent.headless_command.replacen("PROMPT", &quoted, 1)
    } else {
        agent.interactive_command.clone()
    };

    if let (Some(model), Some(flag)) = (model, agent.model_flag.as_deref()) {
        let resolved = agent.resolve_model(model);
        command.push_str(&format!(" {flag} {}", shell_words::quote(&resolved)));
    }

    let paste_prompt = prompt.is_some() && !headless;
    let config = LauncherConfig {
        agent_command: command,
        prompt_mode: if headless { "headless" } else { "interactive" }.to_string(),
        startup_delay: agent.startup_delay,
        ready_pattern: agent.ready_pattern.clone(),
        submit_sequence: agent.submit_sequence.clone(),
        tmux_conf: tmux_policy.as_str().to_string(),
        working_dir: working_dir.to_string_lossy().into_owned(),
        host_uid: host_identity.map(|(uid, _)| uid),
        host_gid: host_identity.map(|(_, gid)| gid),
        state_dir_name: agent.state_dir.clone(),
        debug,
        allowed_domains,
    };
    LaunchPlan {
        config,
        paste_prompt,
    }
}

/// The host identity the entrypoint remaps the in-instance user to.
pub fn host_identity() -> (u32, u32) {
    (
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::find_agent;
    use std::path::PathBuf;

    #[test]
    fn interactive_agent_pastes_prompt() {
        let claude = find_agent("claude").unwrap();
        let plan = compose(
            &claude,
            None,
            Some("fix the tests"),
            &PathBuf::from("/src/app"),
            TmuxConfPolicy::Default,
            Some((1000, 1000)),
            false,
            vec![],
        );
        assert!(plan.paste_prompt);
        assert_eq!(plan.config.agent_command, claude.interactive_command);
        assert_eq!(plan.config.prompt_mode, "interactive");
        assert_eq!(plan.config.working_dir, "/src/app");
        assert_eq!(plan.config.host_uid, Some(1000));
        assert_eq!(plan.config.state_dir_name.as_deref(), Some(".claude"));
    }

    #[test]
    fn headless_agent_bakes_prompt_into_command() {
        let test = find_agent("test").unwrap();
        let plan = compose(
            &test,
            None,
            Some("echo world >> a.txt"),
            &PathBuf::from("/w"),
            TmuxConfPolicy::None,
            None,
            false,
            vec![],
        );
        assert!(!plan.paste_prompt);
        assert_eq!(plan.config.agent_command, "sh -c 'echo world >> a.txt'");
        assert_eq!(plan.config.prompt_mode, "headless");
    }

    #[test]
    fn no_prompt_uses_interactive_command() {
        let test = find_agent("test").unwrap();
        let plan = compose(
            &test,
            None,
            None,
            &PathBuf::from("/w"),
            TmuxConfPolicy::Default,
            None,
            false,
            vec![],
        );
        assert!(!plan.paste_prompt);
        assert_eq!(plan.config.agent_command, "bash");
    }

    #[test]
    fn model_flag_appended_with_alias_resolution() {
        let claude = find_agent("claude").unwrap();
        let plan = compose(
            &claude,
            Some("opus"),
            None,
            &PathBuf::from("/w"),
            TmuxConfPolicy::Default,
            None,
            false,
            vec![],
        );
        assert!(plan.config.agent_command.ends_with("--model claude-opus-4-0"));
    }

    #[test]
    fn config_json_schema_fields() {
        let test = find_agent("test").unwrap();
        let plan = compose(
            &test,
            None,
            None,
            &PathBuf::from("/w"),
            TmuxConfPolicy::DefaultPlusHost,
            Some((501, 20)),
            true,
            vec!["api.anthropic.com".into()],
        );
        let json = serde_json::to_value(&plan.config).unwrap();
        assert_eq!(json["tmux_conf"], "default+host");
        assert_eq!(json["host_uid"], 501);
        assert_eq!(json["debug"], true);
        assert_eq!(json["allowed_domains"][0], "api.anthropic.com");
    }

    #[test]
    fn save_writes_json(){
        let dir = tempfile::tempdir().unwrap();
        let test = find_agent("test").unwrap();
        let plan = compose(
            &test,
            None,
            None,
            &PathBuf::from("/w"),
            TmuxConfPolicy::Default,
            None,
            false,
            vec![],
        );
        let path = dir.path().join("config.json");
        plan.config.save(&path).unwrap();
        let loaded: LauncherConfig =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded.agent_command, "bash");
    }
}
