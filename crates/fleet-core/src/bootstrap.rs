//! Assembly of the init-command recipe a node type is bootstrapped with.
//!
//! The recipe is what gets fingerprinted by `files_hash`. Anything
//! that depends on the live cluster (the head address) is applied
//! afterwards by [`with_head_ip`] so the fingerprint stays stable.

use crate::config::{ClusterConfig, DockerConfig};

/// Environment variable exported to non-head nodes.
pub const HEAD_IP_ENV: &str = "FLEET_HEAD_IP";

/// Global setup, then the node type's setup and start commands,
/// wrapped for docker when configured.
pub fn recipe(config: &ClusterConfig, node_type: &str) -> Vec<String> {
    let mut commands = config.setup_commands.clone();
    if let Some(nt) = config.node_type(node_type) {
        commands.extend(nt.setup_commands.iter().cloned());
        commands.extend(nt.start_commands.iter().cloned());
    }

    match &config.docker {
        Some(docker) => dockerize(&commands, docker),
        None => commands,
    }
}

/// Prefix every command with an export of the head node's address.
pub fn with_head_ip(commands: &[String], head_ip: &str) -> Vec<String> {
    commands
        .iter()
        .map(|cmd| format!("export {HEAD_IP_ENV}={}; {cmd}", shell_quote(head_ip)))
        .collect()
}

/// Start the container (if not already running), then run each
/// command inside it.
pub fn dockerize(commands: &[String], docker: &DockerConfig) -> Vec<String> {
    let name = shell_quote(&docker.container_name);
    let mut run = format!("docker run -d --name {name} --net=host");
    for opt in &docker.run_options {
        run.push(' ');
        run.push_str(opt);
    }
    run.push(' ');
    run.push_str(&shell_quote(&docker.image));
    run.push_str(" sleep infinity");

    let start = format!(
        "docker inspect -f '{{{{.State.Running}}}}' {name} 2>/dev/null | grep -q true || {run}"
    );

    let mut out = vec![start];
    out.extend(
        commands
            .iter()
            .map(|cmd| format!("docker exec {name} /bin/sh -c {}", shell_quote(cmd))),
    );
    out
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}
