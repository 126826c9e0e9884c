//! Command-line arguments. Exactly one discovery backend must be selected.

use std::path::PathBuf;

use clap::{ArgGroup, Parser};

#[derive(Debug, Parser)]
#[command(name = "lbsync")]
#[command(about = "Keeps load-balancer service groups in sync with orchestrator backends", long_about = None)]
#[command(group(
    ArgGroup::new("backend")
        .required(true)
        .multiple(false)
        .args(["swarm_url", "marathon_url", "kubeconfig", "kube_server", "cfg_file"]),
))]
pub struct Args {
    /// Docker / Swarm API URL (unix://, tcp://, http:// or https://)
    #[arg(long)]
    pub swarm_url: Option<String>,
    #[arg(long, requires = "swarm_url", conflicts_with_all = ["marathon_url", "kubeconfig", "kube_server", "cfg_file"])]
    pub swarm_tls_ca_cert: Option<PathBuf>,
    #[arg(long, requires = "swarm_url", conflicts_with_all = ["marathon_url", "kubeconfig", "kube_server", "cfg_file"])]
    pub swarm_tls_cert: Option<PathBuf>,
    #[arg(long, requires = "swarm_url", conflicts_with_all = ["marathon_url", "kubeconfig", "kube_server", "cfg_file"])]
    pub swarm_tls_key: Option<PathBuf>,
    /// Talk plain HTTP to a tcp:// swarm endpoint instead of TLS
    #[arg(long, requires = "swarm_url", conflicts_with_all = ["marathon_url", "kubeconfig", "kube_server", "cfg_file"])]
    pub swarm_allow_insecure: bool,

    /// Marathon base URL, e.g. http://marathon:8080
    #[arg(long)]
    pub marathon_url: Option<String>,
    #[arg(long, requires = "marathon_url", conflicts_with_all = ["swarm_url", "kubeconfig", "kube_server", "cfg_file"])]
    pub marathon_user: Option<String>,
    /// Taken from the environment as well, so it is not rejected next to
    /// other backends.
    #[arg(long, requires = "marathon_url", env = "MARATHON_PASSWORD", hide_env_values = true)]
    pub marathon_password: Option<String>,

    /// kubectl configuration file
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
    /// Kubernetes API server URL, used instead of a kubeconfig
    #[arg(long)]
    pub kube_server: Option<String>,
    #[arg(long, requires = "kube_server", conflicts_with_all = ["kube_token_file", "swarm_url", "marathon_url", "kubeconfig", "cfg_file"])]
    pub kube_token: Option<String>,
    #[arg(long, requires = "kube_server", conflicts_with_all = ["swarm_url", "marathon_url", "kubeconfig", "cfg_file"])]
    pub kube_token_file: Option<PathBuf>,
    #[arg(long, requires = "kube_server", conflicts_with_all = ["swarm_url", "marathon_url", "kubeconfig", "cfg_file"])]
    pub kube_ca: Option<PathBuf>,
    #[arg(long, conflicts_with_all = ["swarm_url", "marathon_url", "cfg_file"])]
    pub kube_insecure_skip_tls_verify: bool,
    #[arg(long, default_value = "default", conflicts_with_all = ["swarm_url", "marathon_url", "cfg_file"])]
    pub kube_namespace: String,

    /// Static JSON file mapping service names to backends
    #[arg(long)]
    pub cfg_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_exactly_one_backend() {
        let args = Args::try_parse_from(["lbsync", "--marathon-url", "http://m:8080"]).unwrap();
        assert_eq!(args.marathon_url.as_deref(), Some("http://m:8080"));
        assert_eq!(args.kube_namespace, "default");

        assert!(Args::try_parse_from([
            "lbsync",
            "--marathon-url",
            "http://m:8080",
            "--cfg-file",
            "apps.json"
        ])
        .is_err());
    }

    #[test]
    fn requires_a_backend() {
        assert!(Args::try_parse_from(["lbsync"]).is_err());
    }

    #[test]
    fn kube_server_options() {
        let args = Args::try_parse_from([
            "lbsync",
            "--kube-server",
            "https://api:6443",
            "--kube-token",
            "abc",
            "--kube-insecure-skip-tls-verify",
            "--kube-namespace",
            "web",
        ])
        .unwrap();
        assert_eq!(args.kube_token.as_deref(), Some("abc"));
        assert!(args.kube_insecure_skip_tls_verify);
        assert_eq!(args.kube_namespace, "web");

        assert!(Args::try_parse_from(["lbsync", "--cfg-file", "a.json", "--kube-token", "abc"]).is_err());
    }

    #[test]
    fn rejects_options_of_other_backends() {
        for stray in [
            ["--kube-token", "abc"],
            ["--kube-ca", "ca.pem"],
            ["--swarm-tls-cert", "cert.pem"],
            ["--marathon-user", "ops"],
            ["--kube-namespace", "web"],
        ] {
            let mut argv = vec!["lbsync", "--cfg-file", "a.json"];
            argv.extend(stray);
            assert!(Args::try_parse_from(argv).is_err(), "{} accepted", stray[0]);
        }

        assert!(Args::try_parse_from(["lbsync", "--kubeconfig", "kc", "--kube-token", "abc"]).is_err());
        assert!(Args::try_parse_from(["lbsync", "--kubeconfig", "kc", "--kube-insecure-skip-tls-verify"]).is_ok());
        assert!(Args::try_parse_from(["lbsync", "--swarm-url", "unix:///var/run/docker.sock", "--swarm-allow-insecure"]).is_ok());
    }
}
