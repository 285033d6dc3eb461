//! `helm template` invocation.

use std::path::{Component, Path, PathBuf};

use pipedk8s_core::config::{HelmChartSource, InputHelmChart, InputHelmOptions};
use url::Url;

use crate::LoaderError;

/// Arguments for `helm template`, run from the application directory.
pub fn template_args(
    app_dir: &Path,
    app_name: &str,
    namespace: &str,
    chart: &InputHelmChart,
    opts: Option<&InputHelmOptions>,
) -> Result<Vec<String>, LoaderError> {
    let release = opts.map(|o| o.release_name.as_str()).filter(|r| !r.is_empty()).unwrap_or(app_name);
    let mut args: Vec<String> = vec!["template".into(), "--no-hooks".into(), "--include-crds".into(), release.to_string()];

    match chart.source()? {
        HelmChartSource::Local { path } => args.push(path.to_string()),
        HelmChartSource::Repository { repository, name, version } => {
            if repository.starts_with("http://") || repository.starts_with("https://") {
                args.extend([name.to_string(), "--repo".into(), repository.to_string()]);
            } else {
                args.push(format!("{}/{}", repository, name));
            }
            if !version.is_empty() {
                args.extend(["--version".into(), version.to_string()]);
            }
        }
        HelmChartSource::Git { remote, .. } => return Err(LoaderError::UnsupportedChart(remote.to_string())),
    }

    if !namespace.is_empty() {
        args.push(format!("--namespace={}", namespace));
    }
    let Some(opts) = opts else { return Ok(args) };
    for (k, v) in &opts.set_values {
        args.extend(["--set".into(), format!("{}={}", k, v)]);
    }
    for f in &opts.value_files {
        verify_values_path(app_dir, f)?;
        args.extend(["-f".into(), f.clone()]);
    }
    for (k, f) in &opts.set_files {
        verify_values_path(app_dir, f)?;
        args.extend(["--set-file".into(), format!("{}={}", k, f)]);
    }
    for v in &opts.api_versions {
        args.extend(["--api-versions".into(), v.clone()]);
    }
    if !opts.kube_version.is_empty() {
        args.extend(["--kube-version".into(), opts.kube_version.clone()]);
    }
    Ok(args)
}

/// Remote http(s) values are allowed; local paths must stay inside `app_dir`
/// after normalization and symlink resolution.
pub fn verify_values_path(app_dir: &Path, value: &str) -> Result<(), LoaderError> {
    if let Ok(u) = Url::parse(value) {
        // Single letters are Windows drive prefixes, not schemes.
        if u.scheme().len() > 1 {
            return match u.scheme() {
                "http" | "https" => Ok(()),
                scheme => Err(LoaderError::UnsupportedScheme { path: value.to_string(), scheme: scheme.to_string() }),
            };
        }
    }
    let joined = if Path::new(value).is_absolute() { PathBuf::from(value) } else { app_dir.join(value) };
    let base = resolve(&lexical_normalize(app_dir));
    let target = resolve(&lexical_normalize(&joined));
    if target.starts_with(&base) {
        Ok(())
    } else {
        Err(LoaderError::OutsideAppDir(value.to_string()))
    }
}

fn resolve(p: &Path) -> PathBuf {
    std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf())
}

fn lexical_normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> InputHelmOptions {
        InputHelmOptions {
            release_name: "rel".into(),
            set_values: [("image.tag".to_string(), "v1".to_string())].into_iter().collect(),
            value_files: vec!["values.yaml".into()],
            api_versions: vec!["monitoring.coreos.com/v1".into()],
            kube_version: "1.29.0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn local_chart_args() {
        let dir = tempfile::tempdir().unwrap();
        let chart = InputHelmChart { path: "chart".into(), ..Default::default() };
        let args = template_args(dir.path(), "simple", "ns", &chart, Some(&opts())).unwrap();
        assert_eq!(
            args,
            vec![
                "template", "--no-hooks", "--include-crds", "rel", "chart", "--namespace=ns", "--set", "image.tag=v1", "-f",
                "values.yaml", "--api-versions", "monitoring.coreos.com/v1", "--kube-version", "1.29.0",
            ]
        );
    }

    #[test]
    fn repository_chart_args() {
        let dir = tempfile::tempdir().unwrap();
        let chart = InputHelmChart { repository: "pipecd".into(), name: "helloworld".into(), version: "v0.3.0".into(), ..Default::default() };
        let args = template_args(dir.path(), "simple", "", &chart, None).unwrap();
        assert_eq!(args, vec!["template", "--no-hooks", "--include-crds", "simple", "pipecd/helloworld", "--version", "v0.3.0"]);

        let by_url = InputHelmChart { repository: "https://charts.example.com".into(), name: "app".into(), ..Default::default() };
        let args = template_args(dir.path(), "simple", "", &by_url, None).unwrap();
        assert_eq!(&args[4..], &["app", "--repo", "https://charts.example.com"]);
    }

    #[test]
    fn git_chart_is_unsupported() {
        let chart = InputHelmChart { git_remote: "git@github.com:org/charts.git".into(), path: "x".into(), ..Default::default() };
        let err = template_args(Path::new("/app"), "simple", "", &chart, None).unwrap_err();
        assert!(matches!(err, LoaderError::UnsupportedChart(_)));
    }

    #[test]
    fn values_paths_must_stay_inside_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        std::fs::create_dir_all(app.join("sub")).unwrap();
        std::fs::write(app.join("values.yaml"), "a: 1").unwrap();

        verify_values_path(&app, "values.yaml").unwrap();
        verify_values_path(&app, "sub/../values.yaml").unwrap();
        verify_values_path(&app, "https://example.com/values.yaml").unwrap();

        let err = verify_values_path(&app, "../outside.yaml").unwrap_err().to_string();
        assert_eq!(err, "values file ../outside.yaml references outside the application configuration directory");
        assert!(verify_values_path(&app, "/etc/passwd").is_err());
        assert!(matches!(verify_values_path(&app, "file:///etc/passwd"), Err(LoaderError::UnsupportedScheme { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_app_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(dir.path().join("secret.yaml"), "a: 1").unwrap();
        std::os::unix::fs::symlink(dir.path().join("secret.yaml"), app.join("link.yaml")).unwrap();
        assert!(matches!(verify_values_path(&app, "link.yaml"), Err(LoaderError::OutsideAppDir(_))));
    }
}
