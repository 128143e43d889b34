use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Path or name of the freezer tool binary.
    pub criu_binary: String,
    /// Path or name of the iproute2 binary used for bridge attach and
    /// address dumps.
    pub ip_binary: String,
    /// Host bridge restored containers are joined to.
    pub bridge: String,
    /// Root of the mounted cgroup hierarchy.
    pub cgroup_root: PathBuf,
    /// Host path the /.dockerinit external mount is rebound to on restore.
    pub dockerinit_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/icebox")),
            criu_binary: std::env::var("CRIU_BINARY").unwrap_or_else(|_| "criu".into()),
            ip_binary: std::env::var("IP_BINARY").unwrap_or_else(|_| "ip".into()),
            bridge: std::env::var("BRIDGE").unwrap_or_else(|_| "docker0".into()),
            cgroup_root: std::env::var("CGROUP_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup")),
            dockerinit_path: std::env::var("DOCKERINIT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/docker/init/dockerinit-1.0.1")),
        }
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.data_dir.join("containers")
    }

    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.containers_dir().join(container_id)
    }

    pub fn checkpoints_dir(&self, container_id: &str) -> PathBuf {
        self.container_dir(container_id).join("checkpoints")
    }

    pub fn checkpoint_dir(&self, container_id: &str, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir(container_id).join(checkpoint_id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/icebox"),
            criu_binary: "criu".into(),
            ip_binary: "ip".into(),
            bridge: "docker0".into(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            dockerinit_path: PathBuf::from("/var/lib/docker/init/dockerinit-1.0.1"),
        }
    }
}
