use serde::{Deserialize, Serialize};

/// How the initial prompt reaches the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Paste into the agent's TUI and send the submit sequence.
    Interactive,
    /// Substitute into the headless command template (`PROMPT` placeholder).
    Headless,
}

/// A host file projected into the instance before the agent starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedFile {
    /// Host location, `~`-expandable. May be absent on the host.
    pub host_path: String,
    /// Destination, relative to the state dir (or the home dir when
    /// `home_dir` is set).
    pub target_path: String,
    /// Skip this seed when an API key is available.
    #[serde(default)]
    pub auth_only: bool,
    /// Root the target at the in-instance home instead of the state dir.
    #[serde(default)]
    pub home_dir: bool,
    /// macOS Keychain service to consult when the host path is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keychain_service: Option<String>,
    /// API keys that gate this seed's `auth_only` behavior. Only set on the
    /// synthetic shell agent, where seeds from different owners coexist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_api_keys: Option<Vec<String>>,
}

/// Static definition of one launchable agent.
#[derive(Debug, Clone)]
pub struct AgentDef {
    pub name: String,
    pub description: String,
    /// Command launched for an interactive session.
    pub interactive_command: String,
    /// Command template used when the prompt is delivered headlessly.
    /// The literal substring `PROMPT` is replaced by the shell-quoted prompt.
    pub headless_command: String,
    pub prompt_mode: PromptMode,
    pub api_key_env_vars: Vec<String>,
    /// Presence of any of these means auth exists without an API key.
    pub auth_hint_env_vars: Vec<String>,
    pub seed_files: Vec<SeedFile>,
    /// Directory name under the in-instance home that holds agent state.
    pub state_dir: Option<String>,
    /// Space-separated tmux key names sent after a pasted prompt.
    pub submit_sequence: String,
    /// Seconds to wait before prompt delivery when no ready pattern exists.
    pub startup_delay: f64,
    /// Pane substring indicating the agent accepts input. Empty = none.
    pub ready_pattern: String,
    pub model_flag: Option<String>,
    pub model_aliases: Vec<(String, String)>,
    /// Hostnames this agent needs when the network is isolated.
    pub network_allow: Vec<String>,
}

impl AgentDef {
    /// Resolve a user-supplied model name through the alias table.
    pub fn resolve_model(&self, model: &str) -> String {
        self.model_aliases
            .iter()
            .find(|(alias, _)| alias == model)
            .map(|(_, full)| full.clone())
            .unwrap_or_else(|| model.to_string())
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn claude() -> AgentDef {
    AgentDef {
        name: "claude".into(),
        description: "Claude Code".into(),
        interactive_command: "claude --dangerously-skip-permissions".into(),
        headless_command: "claude --dangerously-skip-permissions -p PROMPT".into(),
        prompt_mode: PromptMode::Interactive,
        api_key_env_vars: owned(&["ANTHROPIC_API_KEY"]),
        auth_hint_env_vars: owned(&["CLAUDE_CODE_OAUTH_TOKEN"]),
        seed_files: vec![
            SeedFile {
                host_path: "~/.claude.json".into(),
                target_path: ".claude.json".into(),
                auth_only: false,
                home_dir: true,
                keychain_service: None,
                owner_api_keys: None,
            },
            SeedFile {
                host_path: "~/.claude/.credentials.json".into(),
                target_path: ".credentials.json".into(),
                auth_only: true,
                home_dir: false,
                keychain_service: Some("Claude Code-credentials".into()),
                owner_api_keys: None,
            },
        ],
        state_dir: Some(".claude".into()),
        submit_sequence: "Enter".into(),
        startup_delay: 3.0,
        ready_pattern: "? for shortcuts".into(),
        model_flag: Some("--model".into()),
        model_aliases: vec![
            ("opus".into(), "claude-opus-4-0".into()),
            ("sonnet".into(), "claude-sonnet-4-0".into()),
            ("haiku".into(), "claude-3-5-haiku-latest".into()),
        ],
        network_allow: owned(&[
            "api.anthropic.com",
            "statsig.anthropic.com",
            "sentry.io",
        ]),
    }
}

fn codex() -> AgentDef {
    AgentDef {
        name: "codex".into(),
        description: "OpenAI Codex CLI".into(),
        interactive_command: "codex --dangerously-bypass-approvals-and-sandbox".into(),
        headless_command: "codex exec --dangerously-bypass-approvals-and-sandbox PROMPT".into(),
        prompt_mode: PromptMode::Interactive,
        api_key_env_vars: owned(&["OPENAI_API_KEY"]),
        auth_hint_env_vars: vec![],
        seed_files: vec![SeedFile {
            host_path: "~/.codex/auth.json".into(),
            target_path: "auth.json".into(),
            auth_only: true,
            home_dir: false,
            keychain_service: None,
            owner_api_keys: None,
        }],
        state_dir: Some(".codex".into()),
        submit_sequence: "Enter".into(),
        startup_delay: 3.0,
        ready_pattern: "context left".into(),
        model_flag: Some("--model".into()),
        model_aliases: vec![],
        network_allow: owned(&["api.openai.com", "chatgpt.com"]),
    }
}

fn gemini() -> AgentDef {
    AgentDef {
        name: "gemini".into(),
        description: "Google Gemini CLI".into(),
        interactive_command: "gemini --yolo".into(),
        headless_command: "gemini --yolo -p PROMPT".into(),
        prompt_mode: PromptMode::Headless,
        api_key_env_vars: owned(&["GEMINI_API_KEY", "GOOGLE_API_KEY"]),
        auth_hint_env_vars: vec![],
        seed_files: vec![SeedFile {
            host_path: "~/.gemini/oauth_creds.json".into(),
            target_path: "oauth_creds.json".into(),
            auth_only: true,
            home_dir: false,
            keychain_service: None,
            owner_api_keys: None,
        }],
        state_dir: Some(".gemini".into()),
        submit_sequence: "Enter".into(),
        startup_delay: 3.0,
        ready_pattern: "Type your message".into(),
        model_flag: Some("--model".into()),
        model_aliases: vec![],
        network_allow: owned(&["generativelanguage.googleapis.com", "oauth2.googleapis.com"]),
    }
}

fn aider() -> AgentDef {
    AgentDef {
        name: "aider".into(),
        description: "Aider".into(),
        interactive_command: "aider --yes-always".into(),
        headless_command: "aider --yes-always --message PROMPT".into(),
        prompt_mode: PromptMode::Headless,
        api_key_env_vars: owned(&["ANTHROPIC_API_KEY", "OPENAI_API_KEY"]),
        auth_hint_env_vars: vec![],
        seed_files: vec![SeedFile {
            host_path: "~/.aider.conf.yml".into(),
            target_path: ".aider.conf.yml".into(),
            auth_only: false,
            home_dir: true,
            keychain_service: None,
            owner_api_keys: None,
        }],
        state_dir: None,
        submit_sequence: "Enter".into(),
        startup_delay: 5.0,
        ready_pattern: String::new(),
        model_flag: Some("--model".into()),
        model_aliases: vec![],
        network_allow: owned(&["api.anthropic.com", "api.openai.com"]),
    }
}

fn opencode() -> AgentDef {
    AgentDef {
        name: "opencode".into(),
        description: "OpenCode".into(),
        interactive_command: "opencode".into(),
        headless_command: "opencode run PROMPT".into(),
        prompt_mode: PromptMode::Interactive,
        api_key_env_vars: owned(&["ANTHROPIC_API_KEY", "OPENAI_API_KEY"]),
        auth_hint_env_vars: vec![],
        seed_files: vec![SeedFile {
            host_path: "~/.local/share/opencode/auth.json".into(),
            target_path: "auth.json".into(),
            auth_only: true,
            home_dir: false,
            keychain_service: None,
            owner_api_keys: None,
        }],
        state_dir: Some(".opencode".into()),
        submit_sequence: "Enter".into(),
        startup_delay: 3.0,
        ready_pattern: String::new(),
        model_flag: Some("--model".into()),
        model_aliases: vec![],
        network_allow: owned(&["api.anthropic.com", "api.openai.com"]),
    }
}

/// Trivial agent for exercising the harness: runs a shell, or the prompt as
/// a shell command in headless mode.
fn test_agent() -> AgentDef {
    AgentDef {
        name: "test".into(),
        description: "Plain shell (no credentials required)".into(),
        interactive_command: "bash".into(),
        headless_command: "sh -c PROMPT".into(),
        prompt_mode: PromptMode::Headless,
        api_key_env_vars: vec![],
        auth_hint_env_vars: vec![],
        seed_files: vec![],
        state_dir: None,
        submit_sequence: "Enter".into(),
        startup_delay: 0.5,
        ready_pattern: String::new(),
        model_flag: None,
        model_aliases: vec![],
        network_allow: vec![],
    }
}

/// Synthetic aggregate: an interactive shell carrying every real agent's
/// seed files, so any agent can be launched by hand inside the sandbox.
///
/// Seeds that normally live in an agent's state dir are re-rooted into the
/// in-instance home under the owning agent's state-dir basename, and tagged
/// with that agent's API keys so `auth_only` gating still works per owner.
fn shell_agent(real: &[AgentDef]) -> AgentDef {
    let mut seed_files = Vec::new();
    let mut network_allow: Vec<String> = Vec::new();
    for agent in real {
        for seed in &agent.seed_files {
            let mut seed = seed.clone();
            if !seed.home_dir {
                let state = agent.state_dir.as_deref().unwrap_or(&agent.name);
                seed.target_path = format!("{state}/{}", seed.target_path);
                seed.home_dir = true;
            }
            seed.owner_api_keys = Some(agent.api_key_env_vars.clone());
            seed_files.push(seed);
        }
        for host in &agent.network_allow {
            if !network_allow.contains(host) {
                network_allow.push(host.clone());
            }
        }
    }
    AgentDef {
        name: "shell".into(),
        description: "Interactive shell with every agent's credentials".into(),
        interactive_command: "bash".into(),
        headless_command: "sh -c PROMPT".into(),
        prompt_mode: PromptMode::Headless,
        api_key_env_vars: vec![],
        auth_hint_env_vars: vec![],
        seed_files,
        state_dir: None,
        submit_sequence: "Enter".into(),
        startup_delay: 0.5,
        ready_pattern: String::new(),
        model_flag: None,
        model_aliases: vec![],
        network_allow,
    }
}

/// The real agents shipped with the binary, in display order.
pub fn builtin_agents() -> Vec<AgentDef> {
    let real = vec![claude(), codex(), gemini(), aider(), opencode()];
    let shell = shell_agent(&real);
    let mut all = real;
    all.push(test_agent());
    all.push(shell);
    all
}

pub fn find_agent(name: &str) -> Option<AgentDef> {
    builtin_agents().into_iter().find(|a| a.name == name)
}

pub fn agent_names() -> Vec<String> {
    builtin_agents().into_iter().map(|a| a.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_agents() {
        for name in ["claude", "codex", "gemini", "aider", "opencode", "test", "shell"] {
            assert!(find_agent(name).is_some(), "missing agent {name}");
        }
        assert!(find_agent("nope").is_none());
    }

    #[test]
    fn headless_templates_carry_placeholder() {
        for agent in builtin_agents() {
            assert!(
                agent.headless_command.contains("PROMPT"),
                "agent {} lacks PROMPT placeholder",
                agent.name
            );
        }
    }

    #[test]
    fn test_agent_needs_no_credentials() {
        let t = find_agent("test").unwrap();
        assert!(t.api_key_env_vars.is_empty());
        assert!(t.seed_files.is_empty());
    }

    #[test]
    fn shell_unions_and_reroots_seeds() {
        let shell = find_agent("shell").unwrap();
        // Claude's state-dir seed is re-rooted under `.claude/` in the home.
        let cred = shell
            .seed_files
            .iter()
            .find(|s| s.target_path == ".claude/.credentials.json")
            .expect("re-rooted claude credential seed");
        assert!(cred.home_dir);
        assert_eq!(
            cred.owner_api_keys.as_deref(),
            Some(&["ANTHROPIC_API_KEY".to_string()][..])
        );

        // Home-dir seeds keep their target untouched.
        let top = shell
            .seed_files
            .iter()
            .find(|s| s.target_path == ".claude.json")
            .expect("claude.json seed");
        assert!(top.home_dir);
    }

    #[test]
    fn shell_collects_network_allowlist() {
        let shell = find_agent("shell").unwrap();
        assert!(shell.network_allow.contains(&"api.anthropic.com".to_string()));
        assert!(shell.network_allow.contains(&"api.openai.com".to_string()));
        // Deduplicated.
        let count = shell
            .network_allow
            .iter()
            .filter(|h| *h == "api.anthropic.com")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn model_alias_resolution() {
        let c = find_agent("claude").unwrap();
        assert_eq!(c.resolve_model("opus"), "claude-opus-4-0");
        assert_eq!(c.resolve_model("claude-x"), "claude-x");
    }
}
