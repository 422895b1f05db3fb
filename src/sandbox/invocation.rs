//! Builds the process invocation for a sandboxed or direct run.
//!
//! Sandboxed runs go through the container runtime CLI with every isolation
//! flag spelled out; direct runs are a plain `sh -c` in the workspace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use super::SandboxConfig;

/// Container-side mount point for the workspace.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Variables set on the spawned process. For sandboxed runs these are
    /// forwarded by name (`-e KEY`) so values never appear in the argv.
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    pub container_name: Option<String>,
}

impl Invocation {
    /// Container run for `command` with the configured isolation constraints.
    pub fn sandboxed(
        config: &SandboxConfig,
        image: &str,
        workspace: &Path,
        command: &str,
        env: &BTreeMap<String, String>,
        container_name: &str,
    ) -> Self {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--init".into(),
            "--name".into(),
            container_name.into(),
            "--label".into(),
            "shipwright.sandbox=true".into(),
        ];

        let egress_proxy = config
            .egress_proxy
            .as_deref()
            .filter(|_| config.egress_enabled());
        let network = match egress_proxy {
            Some(_) => config.egress_network.as_str(),
            None => "none",
        };
        args.extend(["--network".into(), network.into()]);

        args.extend([
            "--user".into(),
            config.user.clone(),
            "--read-only".into(),
            "--tmpfs".into(),
            format!("/tmp:rw,noexec,nosuid,size={}", config.tmp_size),
            "--memory".into(),
            config.memory.clone(),
            "--memory-swap".into(),
            config.memory.clone(),
            "--cpus".into(),
            config.cpus.to_string(),
            "--pids-limit".into(),
            config.pids_limit.to_string(),
            "--cap-drop".into(),
            "ALL".into(),
        ]);
        for capability in &config.capabilities {
            args.extend(["--cap-add".into(), capability.clone()]);
        }
        args.extend([
            "--security-opt".into(),
            "no-new-privileges".into(),
            "-v".into(),
            format!("{}:{}:rw", workspace.display(), CONTAINER_WORKSPACE),
            "-w".into(),
            CONTAINER_WORKSPACE.into(),
        ]);

        let mut forwarded = env.clone();
        forwarded.insert("HOME".into(), "/tmp".into());
        if let Some(proxy) = egress_proxy {
            forwarded.insert(
                "SHIPWRIGHT_ALLOWED_HOSTS".into(),
                config.registry_hosts.join(","),
            );
            forwarded.insert("HTTP_PROXY".into(), proxy.to_string());
            forwarded.insert("HTTPS_PROXY".into(), proxy.to_string());
        }
        for key in forwarded.keys() {
            args.extend(["-e".into(), key.clone()]);
        }

        args.extend([image.into(), "sh".into(), "-c".into(), command.into()]);

        Self {
            program: config.runtime.clone(),
            args,
            env: forwarded,
            current_dir: None,
            container_name: Some(container_name.to_string()),
        }
    }

    /// Unconfined `sh -c` in `workspace`.
    pub fn direct(workspace: &Path, command: &str, env: &BTreeMap<String, String>) -> Self {
        Self {
            program: "sh".into(),
            args: vec!["-c".into(), command.into()],
            env: env.clone(),
            current_dir: Some(workspace.to_path_buf()),
            container_name: None,
        }
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    /// Forced removal of the container, for timeout and error cleanup.
    pub fn cleanup_command(&self) -> Option<tokio::process::Command> {
        let name = self.container_name.as_ref()?;
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(["rm", "-f", name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Some(command)
    }
}
