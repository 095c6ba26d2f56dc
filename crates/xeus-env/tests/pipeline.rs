//! End-to-end runs of the build pipeline against fake tools.
//!
//! micromamba, mamba and conda are replaced by shell scripts that lay out a minimal
//! emscripten prefix; pip and empack are replaced by in-process fakes.
//! Everything touching `CONDARC` runs under `#[serial]`.

#![cfg(unix)]

use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use xeus_env::pack::ENV_META_FILE;
use xeus_env::{
    Availability, BackendChoice, BuildError, BuildOptions, BuildOutcome, BuildOutput, BuildPhase,
    HostInstaller, InstallRequest, PackRequest, Packer, Pipeline, ProgressHandler,
};

// =============================================================================
// Fakes
// =============================================================================

/// Shell function laying out what the packer, worker and extension steps read.
const POPULATE: &str = r#"
populate() {
  mkdir -p "$1/bin" "$1/share/xeus-lite" "$1/share/jupyter/labextensions/ipycanvas"
  mkdir -p "$1/lib/python3.11/site-packages"
  printf 'engine' > "$1/bin/xpython_wasm.js"
  printf 'wasm' > "$1/bin/xpython_wasm.wasm"
  printf 'const k = XEUS_KERNEL_FILE;\nimportScripts(DATA_FILE);\n' > "$1/share/xeus-lite/worker.ts"
  printf '{"name": "ipycanvas"}' > "$1/share/jupyter/labextensions/ipycanvas/package.json"
}
"#;

const MICROMAMBA: &str = r#"
: > "LOGDIR/micromamba.args"
for a in "$@"; do printf '%s\n' "$a" >> "LOGDIR/micromamba.args"; done
root=""
name=""
while [ $# -gt 0 ]; do
  case "$1" in
    --root-prefix) root="$2"; shift 2 ;;
    --name) name="$2"; shift 2 ;;
    *) shift ;;
  esac
done
[ "EXIT_CODE" = "0" ] || exit EXIT_CODE
populate "$root/envs/$name"
"#;

const CONDA: &str = r#"
cmd="$1"
prefix=""
while [ $# -gt 0 ]; do
  case "$1" in
    --prefix) prefix="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf '%s\n' "$cmd" >> "LOGDIR/conda.calls"
if [ "$cmd" = "install" ]; then
  cat "$CONDARC" > "LOGDIR/condarc.seen"
  [ "FAIL_INSTALL" = "no" ] || exit 2
  populate "$prefix"
fi
"#;

const MAMBA: &str = r#"
cmd="$1"
prefix=""
while [ $# -gt 0 ]; do
  case "$1" in
    --prefix) prefix="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf '%s\n' "$cmd" >> "LOGDIR/mamba.calls"
if [ "$cmd" = "create" ] && [ ! -d "$prefix" ]; then
  echo "prefix $prefix does not exist" >&2
  exit 4
fi
if [ "$cmd" = "install" ]; then
  cat "$CONDARC" > "LOGDIR/condarc.seen"
  populate "$prefix"
fi
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(POPULATE);
    script.push_str(body);
    std::fs::write(&path, script).expect("Failed to write fake tool");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to set permissions");
    path
}

/// Writes one package per specifier, named after the last path component.
struct FakeInstaller {
    compiled: bool,
}

impl HostInstaller for FakeInstaller {
    async fn install(&self, request: &InstallRequest<'_>) -> xeus_env::Result<()> {
        for spec in request.specifiers {
            let name = Path::new(spec)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| spec.clone());
            let pkg = request.target.join(&name);
            let dist_info = request.target.join(format!("{name}-0.1.dist-info"));
            std::fs::create_dir_all(&pkg).unwrap();
            std::fs::create_dir_all(&dist_info).unwrap();
            std::fs::write(pkg.join("__init__.py"), "").unwrap();
            std::fs::write(pkg.join("hey.py"), "print('hey')\n").unwrap();

            let mut record = format!(
                "{name}/__init__.py,,\n{name}/hey.py,,\n{name}-0.1.dist-info/RECORD,,\n"
            );
            if self.compiled {
                std::fs::write(pkg.join("_speedups.so"), "\x7fELF").unwrap();
                record.push_str(&format!("{name}/_speedups.so,,\n"));
            }
            std::fs::write(dist_info.join("RECORD"), record).unwrap();
        }
        Ok(())
    }
}

/// Produces a metadata file and one numbered archive per call.
#[derive(Default)]
struct FakePacker {
    calls: AtomicUsize,
    prefixes: Mutex<Vec<PathBuf>>,
}

impl Packer for FakePacker {
    async fn pack(&self, request: &PackRequest<'_>) -> xeus_env::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(request.relocate_prefix, "/");
        assert!(!request.use_cache);
        assert!(request.prefix.join("bin/xpython_wasm.js").is_file());
        self.prefixes
            .lock()
            .unwrap()
            .push(request.prefix.to_path_buf());

        let archive = format!("env-{n}.tar.gz");
        std::fs::write(request.outdir.join(&archive), "archive").unwrap();
        std::fs::write(
            request.outdir.join(ENV_META_FILE),
            format!(r#"{{"prefix": "/", "packages": [{{"name": "env", "filename": "{archive}"}}]}}"#),
        )
        .unwrap();
        Ok(())
    }
}

/// Counts error events.
#[derive(Default)]
struct ErrorCounter {
    errors: AtomicUsize,
}

impl ProgressHandler for ErrorCounter {
    fn on_progress(&self, phase: BuildPhase) {
        if matches!(phase, BuildPhase::Error { .. }) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    temp: TempDir,
}

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(temp.path().join("bin")).unwrap();
        std::fs::create_dir_all(temp.path().join("logs")).unwrap();
        Self { temp }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.temp.path().join(rel)
    }

    fn logs(&self) -> PathBuf {
        self.path("logs")
    }

    fn options(&self) -> BuildOptions {
        BuildOptions {
            root_prefix: self.path("root"),
            output_dir: self.path("out"),
            ..Default::default()
        }
    }

    fn micromamba(&self, exit_code: i32) -> Availability {
        let body = MICROMAMBA
            .replace("LOGDIR", &self.logs().to_string_lossy())
            .replace("EXIT_CODE", &exit_code.to_string());
        Availability {
            micromamba: Some(write_script(&self.path("bin"), "micromamba", &body)),
            ..Default::default()
        }
    }

    fn conda(&self, fail_install: bool) -> Availability {
        let body = CONDA
            .replace("LOGDIR", &self.logs().to_string_lossy())
            .replace("FAIL_INSTALL", if fail_install { "yes" } else { "no" });
        Availability {
            conda: Some(write_script(&self.path("bin"), "conda", &body)),
            ..Default::default()
        }
    }

    fn mamba(&self) -> Availability {
        let body = MAMBA.replace("LOGDIR", &self.logs().to_string_lossy());
        Availability {
            mamba: Some(write_script(&self.path("bin"), "mamba", &body)),
            ..Default::default()
        }
    }

    fn read_log(&self, name: &str) -> String {
        std::fs::read_to_string(self.logs().join(name)).unwrap_or_default()
    }
}

fn expect_built(outcome: BuildOutcome) -> BuildOutput {
    match outcome {
        BuildOutcome::Built(output) => output,
        BuildOutcome::NothingToDo => panic!("expected a build"),
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
#[serial]
async fn test_defaults_only_is_nothing_to_do() {
    let harness = Harness::new();
    let packer = FakePacker::default();

    let outcome = Pipeline::new(harness.options())
        .with_availability(harness.micromamba(0))
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(packer)
        .run()
        .await
        .unwrap();

    assert!(matches!(outcome, BuildOutcome::NothingToDo));
    assert!(!harness.path("root").exists());
    assert!(!harness.path("out").exists());
    assert!(harness.read_log("micromamba.args").is_empty());
}

#[tokio::test]
#[serial]
async fn test_extra_package_builds_with_micromamba() {
    let harness = Harness::new();
    let options = BuildOptions {
        packages: vec!["numpy".to_string()],
        ..harness.options()
    };

    let pipeline = Pipeline::new(options)
        .with_availability(harness.micromamba(0))
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(FakePacker::default());
    let output = expect_built(pipeline.run().await.unwrap());

    assert_eq!(output.backend, "micromamba");
    assert_eq!(output.env_name, "xeus-python-kernel");

    let args: Vec<String> = harness
        .read_log("micromamba.args")
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(args[0], "create");
    assert!(args.contains(&"--platform=emscripten-wasm32".to_string()));
    assert_eq!(
        &args[args.len() - 4..],
        &["python=3.11", "xeus-lite", "xeus-python=0.15.10", "numpy"]
    );
    let channel_pos = args.iter().position(|a| a == "conda-forge").unwrap();
    let forge_pos = args
        .iter()
        .position(|a| a == "https://repo.mamba.pm/emscripten-forge")
        .unwrap();
    assert!(forge_pos < channel_pos);

    let out = harness.path("out");
    assert_eq!(
        std::fs::read_to_string(out.join("xpython_wasm.js")).unwrap(),
        "engine"
    );
    assert!(out.join("xpython_wasm.wasm").is_file());
    assert!(out.join(ENV_META_FILE).is_file());
    assert_eq!(
        output.bundle_files,
        vec![out.join(ENV_META_FILE), out.join("env-1.tar.gz")]
    );

    // staging removed after a successful run
    assert!(!output.prefix.exists());
    assert!(output.worker_entry.is_none());
    assert!(output.lab_extensions.is_empty());
}

#[tokio::test]
#[serial]
async fn test_local_pip_package_is_relocated() {
    let harness = Harness::new();
    let project = harness.path("project");
    std::fs::create_dir_all(project.join("local_pkg")).unwrap();
    std::fs::write(
        project.join("environment.yml"),
        "name: xeus-python-kernel-1\ndependencies:\n  - pip:\n      - ./local_pkg\n",
    )
    .unwrap();

    let options = BuildOptions {
        environment_file: Some(project.join("environment.yml")),
        keep_staging: true,
        ..harness.options()
    };
    let packer = FakePacker::default();
    let pipeline = Pipeline::new(options)
        .with_availability(harness.micromamba(0))
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(packer);
    let output = expect_built(pipeline.run().await.unwrap());

    assert_eq!(output.env_name, "xeus-python-kernel-1");
    assert_eq!(
        output.prefix,
        harness.path("root/envs/xeus-python-kernel-1")
    );
    assert_eq!(output.relocated_files, 3);

    let site = output.prefix.join("lib/python3.11/site-packages");
    assert_eq!(
        std::fs::read_to_string(site.join("local_pkg/hey.py")).unwrap(),
        "print('hey')\n"
    );
    assert!(site.join("local_pkg-0.1.dist-info/RECORD").is_file());
}

#[tokio::test]
#[serial]
async fn test_compiled_pip_package_fails_before_packing() {
    let harness = Harness::new();
    let project = harness.path("project");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(
        project.join("environment.yml"),
        "dependencies:\n  - pip:\n      - fastpkg\n",
    )
    .unwrap();

    let options = BuildOptions {
        environment_file: Some(project.join("environment.yml")),
        ..harness.options()
    };
    let pipeline = Pipeline::new(options)
        .with_availability(harness.micromamba(0))
        .with_installer(FakeInstaller { compiled: true })
        .with_packer(FakePacker::default());

    let err = pipeline.run().await.unwrap_err();
    match err {
        BuildError::UnsupportedArtifact { path } => {
            assert!(path.to_string_lossy().ends_with("_speedups.so"))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!harness.path("out").join(ENV_META_FILE).exists());

    // failed staging is left for inspection, without any relocated file
    let site = harness.path("root/envs/xeus-python-kernel/lib/python3.11/site-packages");
    assert!(site.is_dir());
    assert!(!site.join("fastpkg").exists());
}

#[tokio::test]
#[serial]
async fn test_rerun_replaces_previous_outputs() {
    let harness = Harness::new();
    let options = BuildOptions {
        packages: vec!["numpy".to_string()],
        ..harness.options()
    };
    let pipeline = Pipeline::new(options)
        .with_availability(harness.micromamba(0))
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(FakePacker::default());

    expect_built(pipeline.run().await.unwrap());
    let second = expect_built(pipeline.run().await.unwrap());

    let out = harness.path("out");
    assert!(!out.join("env-1.tar.gz").exists());
    assert!(out.join("env-2.tar.gz").is_file());
    assert_eq!(second.bundle_files.len(), 2);

    let root = harness.path("root");
    assert!(!root.join("envs").exists());
    assert!(!root.join("work").exists());
}

#[tokio::test]
#[serial]
async fn test_missing_environment_file_is_ignored() {
    let harness = Harness::new();
    let options = BuildOptions {
        packages: vec!["numpy".to_string()],
        environment_file: Some(harness.path("nope/environment.yml")),
        ..harness.options()
    };
    let pipeline = Pipeline::new(options)
        .with_availability(harness.micromamba(0))
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(FakePacker::default());

    let output = expect_built(pipeline.run().await.unwrap());
    assert_eq!(output.relocated_files, 0);
}

#[tokio::test]
#[serial]
async fn test_worker_and_lab_extensions() {
    let harness = Harness::new();
    let options = BuildOptions {
        packages: vec!["ipycanvas".to_string()],
        build_worker: true,
        labextensions_dir: Some(harness.path("labextensions")),
        ..harness.options()
    };
    let pipeline = Pipeline::new(options)
        .with_availability(harness.micromamba(0))
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(FakePacker::default());
    let output = expect_built(pipeline.run().await.unwrap());

    let worker = output.worker_entry.expect("worker should be installed");
    let source = std::fs::read_to_string(&worker).unwrap();
    assert!(source.contains("const k = 'xpython_wasm.js';"));
    assert!(source.contains("bootstrap_from_empack_packed_environment"));
    assert!(!source.contains("importScripts(DATA_FILE);"));

    assert_eq!(
        output.lab_extensions,
        vec![harness.path("labextensions/ipycanvas")]
    );
    assert!(harness
        .path("labextensions/ipycanvas/package.json")
        .is_file());
}

// =============================================================================
// Backends and CONDARC
// =============================================================================

#[tokio::test]
#[serial]
async fn test_conda_two_step_restores_condarc() {
    let harness = Harness::new();
    let original = harness.path("user.condarc");
    std::env::set_var("CONDARC", &original);

    let options = BuildOptions {
        packages: vec!["numpy".to_string()],
        backend: BackendChoice::Conda,
        ..harness.options()
    };
    let pipeline = Pipeline::new(options)
        .with_availability(harness.conda(false))
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(FakePacker::default());
    let result = pipeline.run().await;

    let restored = std::env::var_os("CONDARC");
    std::env::remove_var("CONDARC");

    let output = expect_built(result.unwrap());
    assert_eq!(output.backend, "conda");
    assert_eq!(harness.read_log("conda.calls"), "create\ninstall\n");
    assert_eq!(
        harness.read_log("condarc.seen"),
        "subdir: emscripten-wasm32"
    );
    assert_eq!(restored, Some(original.into_os_string()));
}

#[tokio::test]
#[serial]
async fn test_mamba_creates_prefix_before_two_step() {
    let harness = Harness::new();
    std::env::remove_var("CONDARC");

    let options = BuildOptions {
        packages: vec!["numpy".to_string()],
        backend: BackendChoice::Mamba,
        ..harness.options()
    };
    let pipeline = Pipeline::new(options)
        .with_availability(harness.mamba())
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(FakePacker::default());
    let result = pipeline.run().await;

    assert!(std::env::var_os("CONDARC").is_none());
    let output = expect_built(result.unwrap());
    assert_eq!(output.backend, "mamba");
    assert_eq!(harness.read_log("mamba.calls"), "create\ninstall\n");
    assert_eq!(
        harness.read_log("condarc.seen"),
        "subdir: emscripten-wasm32"
    );
    assert!(harness.path("out/xpython_wasm.wasm").is_file());
}

#[tokio::test]
#[serial]
async fn test_condarc_removed_after_failed_install() {
    let harness = Harness::new();
    std::env::remove_var("CONDARC");

    let options = BuildOptions {
        packages: vec!["numpy".to_string()],
        ..harness.options()
    };
    let pipeline = Pipeline::new(options)
        .with_availability(harness.conda(true))
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(FakePacker::default());

    let err = pipeline.run().await.unwrap_err();
    assert!(std::env::var_os("CONDARC").is_none());
    match err {
        BuildError::BackendExecutionFailed { tool, status } => {
            assert_eq!(tool, "conda");
            assert_eq!(status, "exit code 2");
        }
        other => panic!("unexpected error: {other}"),
    }
    // the install step did see the platform config
    assert_eq!(
        harness.read_log("condarc.seen"),
        "subdir: emscripten-wasm32"
    );
    // staging kept for inspection
    assert!(harness.path("root/envs/xeus-python-kernel/.condarc").is_file());
}

#[tokio::test]
#[serial]
async fn test_failed_backend_with_cleanup() {
    let harness = Harness::new();
    let options = BuildOptions {
        packages: vec!["numpy".to_string()],
        cleanup_on_failure: true,
        ..harness.options()
    };
    let counter = Arc::new(ErrorCounter::default());
    let pipeline = Pipeline::new(options)
        .with_availability(harness.micromamba(3))
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(FakePacker::default())
        .with_handler(counter.clone());

    let err = pipeline.run().await.unwrap_err();
    assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
    assert!(matches!(
        err,
        BuildError::BackendExecutionFailed { ref tool, .. } if tool == "micromamba"
    ));
    assert!(!harness.path("root/envs").exists());
}

#[tokio::test]
#[serial]
async fn test_no_backend_available() {
    let harness = Harness::new();
    let options = BuildOptions {
        force: true,
        ..harness.options()
    };
    let pipeline = Pipeline::new(options)
        .with_availability(Availability::default())
        .with_installer(FakeInstaller { compiled: false })
        .with_packer(FakePacker::default());

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, BuildError::BackendUnavailable { .. }));
}
