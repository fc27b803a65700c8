use assert_cmd::Command;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub const KUBERNETES_VERSION: &str = "1.31.4";

/// A scratch `file://` state store, simulator cloud and release mirror
pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let project = Self { root };
        fs::create_dir_all(project.state_dir()).unwrap();

        let bin = project
            .path()
            .join("release")
            .join(format!("v{KUBERNETES_VERSION}"))
            .join("bin/linux/amd64");
        fs::create_dir_all(&bin).unwrap();
        for (binary, hash) in [("kubelet", "a"), ("kubectl", "b")] {
            fs::write(bin.join(format!("{binary}.sha256")), hash.repeat(64)).unwrap();
        }
        project
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path().join("state")
    }

    #[allow(dead_code)]
    pub fn cluster_config(&self, name: &str) -> PathBuf {
        self.state_dir().join(name).join("config")
    }

    /// `kops` wired to this project only
    pub fn kops(&self) -> Command {
        let mut cmd = Command::cargo_bin("kops").unwrap();
        cmd.current_dir(self.path())
            .env_clear()
            .env("HOME", self.path())
            .env("KOPS_STATE_STORE", format!("file://{}", self.state_dir().display()))
            .env("KOPS_MOCK_CLOUD_STATE", self.path().join("cloud.json"))
            .env(
                "KOPS_KUBERNETES_BASE_URL",
                format!("file://{}", self.path().join("release").display()),
            );
        cmd
    }

    #[allow(dead_code)]
    pub fn create_cluster(&self, name: &str, zones: &str, control_plane_zones: Option<&str>) {
        let mut cmd = self.kops();
        cmd.args(["create", "cluster", name, "--zones", zones])
            .args(["--kubernetes-version", KUBERNETES_VERSION]);
        if let Some(zones) = control_plane_zones {
            cmd.args(["--master-zones", zones]);
        }
        cmd.assert().success();
    }
}
