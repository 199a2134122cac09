//! Boot-script templates.

use esgrid_core::Role;
use esgrid_core::config::BootstrapSettings;

/// Runtime user, checkout location, and service paths baked into scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapProfile {
    pub user: String,
    /// Repository checkout, relative to the user's home (`~/...`) or absolute.
    pub code_dir: String,
    /// Subdirectory of `code_dir` the role process runs from.
    pub project_dir: String,
    pub log_file: String,
    pub store_config: String,
    pub store_service: String,
    pub socket_dir: String,
}

impl Default for BootstrapProfile {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            code_dir: "~/Git/neuroevolved-agents".to_string(),
            project_dir: "es-distributed".to_string(),
            log_file: "/home/ubuntu/user_data.log".to_string(),
            store_config: "/etc/redis/redis.conf".to_string(),
            store_service: "redis".to_string(),
            socket_dir: "/var/run/redis".to_string(),
        }
    }
}

impl BootstrapProfile {
    /// Apply `[bootstrap]` overrides. Changing only the user moves the
    /// default log file into that user's home.
    pub fn from_settings(settings: &BootstrapSettings) -> Self {
        let mut profile = Self::default();
        if let Some(user) = &settings.user {
            profile.log_file = format!("/home/{user}/user_data.log");
            profile.user = user.clone();
        }
        if let Some(code_dir) = &settings.code_dir {
            profile.code_dir = code_dir.clone();
        }
        if let Some(log_file) = &settings.log_file {
            profile.log_file = log_file.clone();
        }
        profile
    }

    pub fn socket_path(&self) -> String {
        format!("{}/redis.sock", self.socket_dir)
    }
}

/// Role-specific template inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptParams<'a> {
    Master {
        /// Compact experiment JSON, written verbatim to `~/experiment.json`.
        experiment_json: &'a str,
        algorithm: &'a str,
    },
    Worker {
        master_address: &'a str,
        algorithm: &'a str,
    },
}

impl ScriptParams<'_> {
    pub fn role(&self) -> Role {
        match self {
            ScriptParams::Master { .. } => Role::Master,
            ScriptParams::Worker { .. } => Role::Worker,
        }
    }
}

pub fn master_script(profile: &BootstrapProfile, experiment_json: &str, algorithm: &str) -> String {
    render(
        profile,
        ScriptParams::Master {
            experiment_json,
            algorithm,
        },
    )
}

pub fn worker_script(profile: &BootstrapProfile, master_address: &str, algorithm: &str) -> String {
    render(
        profile,
        ScriptParams::Worker {
            master_address,
            algorithm,
        },
    )
}

/// Assemble the full boot script for a node.
pub fn render(profile: &BootstrapProfile, params: ScriptParams<'_>) -> String {
    let mut script = String::from("#!/bin/bash\n{\nset -x\n\n");
    script.push_str(DISABLE_HYPERTHREADING);
    script.push('\n');
    script.push_str(&store_config_section(profile, params.role()));
    script.push('\n');
    script.push_str(&format!("systemctl restart {}\n\n", profile.store_service));
    script.push_str(&fetch_and_run_section(profile, &role_command(profile, params)));
    script.push_str(&format!("}} >> {} 2>&1\n", profile.log_file));
    script
}

const DISABLE_HYPERTHREADING: &str = r#"# disable hyperthreading
for cpunum in $(
    cat /sys/devices/system/cpu/cpu*/topology/thread_siblings_list |
    sed 's/-/,/g' | cut -s -d, -f2- | tr ',' '\n' | sort -un); do
        echo 0 > /sys/devices/system/cpu/cpu$cpunum/online
done
"#;

fn store_config_section(profile: &BootstrapProfile, role: Role) -> String {
    let conf = &profile.store_config;
    let mut out = String::new();

    out.push_str("# Disable redis snapshots\n");
    out.push_str(&format!("echo 'save \"\"' >> {conf}\n\n"));

    match role {
        Role::Master => {
            out.push_str("# Unix socket for the local master process; TCP stays on for workers\n");
        }
        Role::Worker => {
            out.push_str("# Unix socket only; TCP disabled\n");
            out.push_str(&format!("sed -i -e \"s/^port 6379$/port 0/\" {conf}\n"));
        }
    }

    out.push_str(&format!("echo \"unixsocket {}\" >> {conf}\n", profile.socket_path()));
    out.push_str(&format!("echo \"unixsocketperm 777\" >> {conf}\n"));
    out.push_str(&format!("mkdir -p {}\n", profile.socket_dir));
    out.push_str(&format!(
        "chown {user}:{user} {dir}\n",
        user = profile.user,
        dir = profile.socket_dir
    ));
    out
}

fn role_command(profile: &BootstrapProfile, params: ScriptParams<'_>) -> String {
    match params {
        ScriptParams::Master {
            experiment_json,
            algorithm,
        } => format!(
            "cat > ~/experiment.json <<'EXPERIMENT'\n\
             {experiment_json}\n\
             EXPERIMENT\n\
             python -m es_distributed.main master \\\n    \
             --master_socket_path {socket} \\\n    \
             --log_dir ~ \\\n    \
             --exp_file ~/experiment.json \\\n    \
             --algo {algorithm}\n",
            socket = profile.socket_path(),
        ),
        ScriptParams::Worker {
            master_address,
            algorithm,
        } => format!(
            "MKL_NUM_THREADS=1 OPENBLAS_NUM_THREADS=1 OMP_NUM_THREADS=1 \
             python -m es_distributed.main workers \
             --master_host {master_address} \
             --algo {algorithm} \
             --relay_socket_path {socket}\n",
            socket = profile.socket_path(),
        ),
    }
}

fn fetch_and_run_section(profile: &BootstrapProfile, command: &str) -> String {
    format!(
        "su -l {user} <<'EOF'\n\
         set -x\n\
         cd {code_dir}/\n\
         git pull\n\
         . env/bin/activate\n\
         cd {project_dir}\n\
         {command}\
         EOF\n",
        user = profile.user,
        code_dir = profile.code_dir,
        project_dir = profile.project_dir,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXP: &str = r#"{"exp_prefix":"demo"}"#;

    fn profile() -> BootstrapProfile {
        BootstrapProfile::default()
    }

    #[test]
    fn master_embeds_algorithm_and_experiment() {
        let script = master_script(&profile(), EXP, "es");
        assert!(script.starts_with("#!/bin/bash\n{\nset -x\n"));
        assert!(script.contains("--algo es\n"));
        assert!(script.contains(&format!("\n{EXP}\nEXPERIMENT\n")));
        assert!(script.contains("--master_socket_path /var/run/redis/redis.sock"));
        assert!(script.contains("--exp_file ~/experiment.json"));
        assert!(script.ends_with("} >> /home/ubuntu/user_data.log 2>&1\n"));
    }

    #[test]
    fn worker_embeds_master_address_not_experiment() {
        let script = worker_script(&profile(), "10.0.1.17", "es");
        assert!(script.contains("--master_host 10.0.1.17 "));
        assert!(script.contains("--algo es "));
        assert!(script.contains("--relay_socket_path /var/run/redis/redis.sock"));
        assert!(script.contains("OMP_NUM_THREADS=1"));
        assert!(!script.contains(EXP));
        assert!(!script.contains("experiment.json"));
    }

    #[test]
    fn only_workers_disable_the_store_port() {
        let master = master_script(&profile(), EXP, "es");
        let worker = worker_script(&profile(), "10.0.1.17", "es");
        assert!(worker.contains("s/^port 6379$/port 0/"));
        assert!(!master.contains("port 0"));
    }

    #[test]
    fn both_roles_share_common_steps() {
        for script in [
            master_script(&profile(), EXP, "es"),
            worker_script(&profile(), "10.0.1.17", "es"),
        ] {
            assert!(script.contains("thread_siblings_list"));
            assert!(script.contains("echo 'save \"\"' >> /etc/redis/redis.conf"));
            assert!(script.contains("echo \"unixsocket /var/run/redis/redis.sock\""));
            assert!(script.contains("echo \"unixsocketperm 777\""));
            assert!(script.contains("chown ubuntu:ubuntu /var/run/redis"));
            assert!(script.contains("systemctl restart redis\n"));
            assert!(script.contains("su -l ubuntu <<'EOF'\nset -x\ncd ~/Git/neuroevolved-agents/\ngit pull\n"));
            assert!(!script.contains("set -e"));
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(
            master_script(&profile(), EXP, "es"),
            master_script(&profile(), EXP, "es")
        );
        assert_eq!(
            worker_script(&profile(), "10.0.1.17", "ga"),
            worker_script(&profile(), "10.0.1.17", "ga")
        );
    }

    #[test]
    fn steps_are_ordered() {
        let script = worker_script(&profile(), "10.0.1.17", "es");
        let ht = script.find("thread_siblings_list").unwrap();
        let conf = script.find("Disable redis snapshots").unwrap();
        let restart = script.find("systemctl restart").unwrap();
        let run = script.find("su -l ubuntu").unwrap();
        assert!(ht < conf && conf < restart && restart < run);
    }

    #[test]
    fn settings_override_user_and_log() {
        let settings = BootstrapSettings {
            user: Some("es".to_string()),
            code_dir: Some("/opt/es".to_string()),
            log_file: None,
        };
        let p = BootstrapProfile::from_settings(&settings);
        let script = worker_script(&p, "10.0.0.2", "es");
        assert!(script.contains("su -l es <<'EOF'"));
        assert!(script.contains("cd /opt/es/\n"));
        assert!(script.contains("chown es:es /var/run/redis"));
        assert!(script.ends_with("} >> /home/es/user_data.log 2>&1\n"));
    }

    #[test]
    fn params_report_role() {
        let m = ScriptParams::Master { experiment_json: EXP, algorithm: "es" };
        let w = ScriptParams::Worker { master_address: "10.0.0.2", algorithm: "es" };
        assert_eq!(m.role(), Role::Master);
        assert_eq!(w.role(), Role::Worker);
    }
}
