//! External programs the build drives.
//!
//! Every process the pipeline launches goes through [`HostTools`]. The
//! production implementation, [`SystemTools`], runs the real binaries with
//! stdout/stderr passed through; tests substitute a recording fake.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::artifact::iso::{mkisofs_args, IsoOptions};

/// `PATH` given to scripts run inside the chroot.
pub const CHROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host-side operations of a build.
pub trait HostTools {
    /// Run a base layer's build script; it populates `build_dir`.
    fn run_layer_build(&self, script: &Path, build_dir: &Path) -> Result<()>;

    /// Clone `url` into `dest`. A depth of 0 clones the full history.
    fn git_clone(&self, url: &str, depth: u32, dest: &Path) -> Result<()>;

    fn git_checkout(&self, repo_dir: &Path, reference: &str) -> Result<()>;

    /// Abbreviated hash of `HEAD`.
    fn git_short_head(&self, repo_dir: &Path) -> Result<String>;

    /// Run `script` (a path inside the chroot) with a sanitized environment.
    fn run_in_chroot(&self, chroot: &Path, script: &Path, cwd: &Path) -> Result<()>;

    /// Run a layer's pre-image script against a provisioned chroot.
    fn run_pre_image(&self, script: &Path, chroot: &Path, image_dir: &Path) -> Result<()>;

    /// Assemble `image_dir` into an ISO at `output`.
    fn make_iso(&self, image_dir: &Path, output: &Path, options: &IsoOptions) -> Result<()>;
}

/// Runs the real host binaries.
#[derive(Debug, Default, Clone)]
pub struct SystemTools;

impl SystemTools {
    pub fn new() -> Self {
        Self
    }
}

impl HostTools for SystemTools {
    fn run_layer_build(&self, script: &Path, build_dir: &Path) -> Result<()> {
        let mut cmd = Command::new(script);
        cmd.arg(build_dir);
        if let Some(layer_dir) = script.parent() {
            cmd.current_dir(layer_dir);
        }
        run_checked(&mut cmd, &format!("build script '{}'", script.display()))
    }

    fn git_clone(&self, url: &str, depth: u32, dest: &Path) -> Result<()> {
        run_checked(
            &mut git_clone_command(url, depth, dest),
            &format!("git clone of '{url}'"),
        )
    }

    fn git_checkout(&self, repo_dir: &Path, reference: &str) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo_dir).args(["checkout", "-q", reference]);
        run_checked(&mut cmd, &format!("git checkout of '{reference}'"))
    }

    fn git_short_head(&self, repo_dir: &Path) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_dir)
            .args(["rev-parse", "--short", "HEAD"])
            .stderr(Stdio::inherit())
            .output()
            .context("running git rev-parse")?;
        if !output.status.success() {
            bail!("git rev-parse exited with {}", output.status);
        }
        let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if head.is_empty() {
            bail!("git rev-parse printed no commit hash");
        }
        Ok(head)
    }

    fn run_in_chroot(&self, chroot: &Path, script: &Path, cwd: &Path) -> Result<()> {
        let lang = std::env::var("LANG").unwrap_or_else(|_| "C".to_string());
        run_checked(
            &mut chroot_command(chroot, script, cwd, &lang),
            &format!("provisioning script '{}' in chroot", script.display()),
        )
    }

    fn run_pre_image(&self, script: &Path, chroot: &Path, image_dir: &Path) -> Result<()> {
        let mut cmd = Command::new(script);
        cmd.arg(chroot).arg(image_dir);
        if let Some(layer_dir) = script.parent() {
            cmd.current_dir(layer_dir);
        }
        run_checked(&mut cmd, &format!("pre-image script '{}'", script.display()))
    }

    fn make_iso(&self, image_dir: &Path, output: &Path, options: &IsoOptions) -> Result<()> {
        let mut cmd = Command::new("mkisofs");
        cmd.args(mkisofs_args(image_dir, output, options));
        run_checked(&mut cmd, "mkisofs")
    }
}

/// `git clone`; a depth of 0 fetches full history, otherwise every branch is
/// fetched shallow so any `repo_checkout` can be checked out afterwards.
fn git_clone_command(url: &str, depth: u32, dest: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("clone");
    if depth > 0 {
        cmd.arg("--depth").arg(depth.to_string()).arg("--no-single-branch");
    }
    cmd.arg("--").arg(url).arg(dest);
    cmd
}

/// `chroot <chroot> <script>` run from `cwd` with [`sanitize_env`] applied.
fn chroot_command(chroot: &Path, script: &Path, cwd: &Path, lang: &str) -> Command {
    let mut cmd = Command::new("chroot");
    cmd.arg(chroot).arg(script).current_dir(cwd);
    sanitize_env(&mut cmd, lang);
    cmd
}

/// Replace the inherited environment with `PATH` and `LANG` only.
fn sanitize_env(cmd: &mut Command, lang: &str) {
    cmd.env_clear().env("PATH", CHROOT_PATH).env("LANG", lang);
}

/// Run a command with inherited stdio; non-zero exit is an error.
fn run_checked(cmd: &mut Command, what: &str) -> Result<()> {
    debug!(command = ?cmd, "Running");
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to execute {what}"))?;

    if !status.success() {
        match status.code() {
            Some(code) => bail!("{what} failed with exit code {code}"),
            None => bail!("{what} was terminated by a signal"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::command_exists;
    use std::ffi::OsStr;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn layer_build_receives_output_dir_and_runs_in_layer_dir() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer");
        let out = tmp.path().join("out");
        fs::create_dir_all(&layer).unwrap();
        fs::create_dir_all(&out).unwrap();
        fs::write(layer.join("marker"), b"from layer").unwrap();
        let build = script(&layer, ".build.sh", "cp marker \"$1/marker\"");

        SystemTools::new().run_layer_build(&build, &out).unwrap();
        assert_eq!(fs::read(out.join("marker")).unwrap(), b"from layer");
    }

    #[test]
    fn non_zero_exit_is_reported() {
        let tmp = TempDir::new().unwrap();
        let build = script(tmp.path(), ".build.sh", "exit 3");
        let err = SystemTools::new()
            .run_layer_build(&build, tmp.path())
            .unwrap_err();
        assert!(err.to_string().contains("exit code 3"), "{err}");
    }

    #[test]
    fn pre_image_gets_chroot_and_image_dirs() {
        let tmp = TempDir::new().unwrap();
        let chroot = tmp.path().join("chroot");
        let image = tmp.path().join("image");
        fs::create_dir_all(&chroot).unwrap();
        fs::create_dir_all(&image).unwrap();
        let pre = script(
            tmp.path(),
            ".pre_image.sh",
            "test -d \"$1\" && echo squashed > \"$2/filesystem.squashfs\"",
        );

        SystemTools::new().run_pre_image(&pre, &chroot, &image).unwrap();
        assert!(image.join("filesystem.squashfs").is_file());
    }

    #[test]
    fn chroot_command_runs_from_the_layer_dir_with_a_bare_environment() {
        let cmd = chroot_command(
            Path::new("/scratch/build-foo/chroot"),
            Path::new("/root/provision/run.sh"),
            Path::new("/srv/layers/debian"),
            "en_US.UTF-8",
        );
        assert_eq!(cmd.get_program(), "chroot");
        assert_eq!(
            cmd.get_args().collect::<Vec<_>>(),
            ["/scratch/build-foo/chroot", "/root/provision/run.sh"]
        );
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/srv/layers/debian")));

        let mut envs: Vec<_> = cmd.get_envs().collect();
        envs.sort();
        assert_eq!(
            envs,
            [
                (OsStr::new("LANG"), Some(OsStr::new("en_US.UTF-8"))),
                (OsStr::new("PATH"), Some(OsStr::new(CHROOT_PATH))),
            ]
        );
    }

    #[test]
    fn sanitized_environment_drops_inherited_variables() {
        let mut cmd = Command::new("env");
        sanitize_env(&mut cmd, "C");
        let output = cmd.output().unwrap();
        assert!(output.status.success());

        let mut vars: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        vars.sort();
        assert_eq!(vars, ["LANG=C".to_string(), format!("PATH={CHROOT_PATH}")]);
    }

    #[test]
    fn clone_depth_zero_fetches_full_history() {
        let full = git_clone_command("git@example.org:ops/provision.git", 0, Path::new("/tmp/p"));
        assert_eq!(
            full.get_args().collect::<Vec<_>>(),
            ["clone", "--", "git@example.org:ops/provision.git", "/tmp/p"]
        );

        let shallow = git_clone_command("https://example.org/p.git", 3, Path::new("/tmp/p"));
        assert_eq!(
            shallow.get_args().collect::<Vec<_>>(),
            [
                "clone",
                "--depth",
                "3",
                "--no-single-branch",
                "--",
                "https://example.org/p.git",
                "/tmp/p"
            ]
        );
    }

    /// Run git in `dir` with a throwaway identity; returns trimmed stdout.
    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args([
                "-c",
                "user.name=builder",
                "-c",
                "user.email=builder@example.org",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?}: {output:?}");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    #[test]
    fn clone_checkout_and_head_against_a_real_repository() {
        if !command_exists("git") {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let origin = tmp.path().join("origin");
        fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init", "-q"]);
        fs::write(origin.join("run.sh"), "#!/bin/sh\necho one\n").unwrap();
        git(&origin, &["add", "run.sh"]);
        git(&origin, &["commit", "-q", "-m", "one"]);
        fs::write(origin.join("run.sh"), "#!/bin/sh\necho two\n").unwrap();
        git(&origin, &["commit", "-q", "-a", "-m", "two"]);
        git(&origin, &["branch", "stable", "HEAD~1"]);
        let stable = git(&origin, &["rev-parse", "stable"]);

        let tools = SystemTools::new();

        let full = tmp.path().join("full/root/provision");
        tools.git_clone(origin.to_str().unwrap(), 0, &full).unwrap();
        assert_eq!(git(&full, &["rev-list", "--count", "HEAD"]), "2");

        // Local paths ignore --depth; a file:// URL goes through the transport.
        let url = format!("file://{}", origin.display());
        let shallow = tmp.path().join("shallow/root/provision");
        tools.git_clone(&url, 1, &shallow).unwrap();
        assert_eq!(git(&shallow, &["rev-list", "--count", "HEAD"]), "1");

        tools.git_checkout(&shallow, "stable").unwrap();
        let head = tools.git_short_head(&shallow).unwrap();
        assert!(head.len() >= 4 && stable.starts_with(&head), "{head} vs {stable}");
        assert_eq!(
            fs::read_to_string(shallow.join("run.sh")).unwrap(),
            "#!/bin/sh\necho one\n"
        );

        assert!(tools.git_checkout(&shallow, "no-such-branch").is_err());
    }
}
