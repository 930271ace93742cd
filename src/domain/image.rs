//! Image identity and build description for an app.

use serde_json::json;
use sha2::{Digest, Sha256};

use super::model::{AppSpec, CodeOrigin};

const TAG_LENGTH: usize = 16;
const CODE_DIR: &str = "/srv/app";
const CRAN_MIRROR: &str = "https://cloud.r-project.org";

/// Image repository name of an app, `<prefix>-<slug>`.
pub fn image_name(prefix: &str, slug: &str) -> String {
    format!("{}-{}", prefix, slug)
}

/// Content hash of every input that shapes the built image.
///
/// Package order is irrelevant, everything else is taken verbatim.
pub fn image_tag(spec: &AppSpec) -> String {
    let mut packages = spec.packages.clone();
    packages.sort();
    let code_origin = match &spec.code_origin {
        CodeOrigin::Git { repository, branch } => json!({
            "type": "git",
            "repository": repository,
            "branch": branch,
        }),
        CodeOrigin::Uploaded => json!({ "type": "uploaded" }),
    };
    let canonical = json!({
        "runtime_version": spec.runtime_version,
        "packages": packages,
        "code_origin": code_origin,
        "entry_point": spec.entry_point,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..TAG_LENGTH].to_string()
}

/// Single-quoted R string literal.
fn r_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Dockerfile for an app whose code sits in `code/` of the build context.
///
/// RUN and CMD use the exec form, user supplied values end up JSON escaped.
pub fn dockerfile(spec: &AppSpec, base_image: &str, port: u16) -> String {
    let mut lines = vec![format!("FROM {}:{}", base_image, spec.runtime_version)];
    if !spec.packages.is_empty() {
        let packages = spec
            .packages
            .iter()
            .map(|package| r_string(package))
            .collect::<Vec<_>>()
            .join(", ");
        let install = format!(
            "install.packages(c({}), repos={})",
            packages,
            r_string(CRAN_MIRROR)
        );
        lines.push(format!("RUN {}", json!(["R", "-e", install])));
    }
    lines.push(format!("COPY code/ {}/", CODE_DIR));
    lines.push(format!("WORKDIR {}", CODE_DIR));
    lines.push(format!("EXPOSE {}", port));
    lines.push(format!(
        "HEALTHCHECK --interval=30s --timeout=5s --start-period=30s --retries=3 \
         CMD bash -c 'echo > /dev/tcp/127.0.0.1/{}' || exit 1",
        port
    ));
    let entry = format!("{}/{}", CODE_DIR, spec.entry_point);
    lines.push(format!("CMD {}", json!(["Rscript", entry])));
    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> AppSpec {
        AppSpec {
            id: "app-1".to_string(),
            slug: "sales".to_string(),
            runtime_version: "4.3.2".to_string(),
            packages: vec!["shiny".to_string(), "dplyr".to_string()],
            code_origin: CodeOrigin::Git {
                repository: "https://example.org/sales.git".to_string(),
                branch: None,
            },
            entry_point: "app.R".to_string(),
            replicas: 2,
        }
    }

    #[test]
    fn identical_inputs_hash_to_the_same_tag() {
        assert_eq!(image_tag(&spec()), image_tag(&spec()));
        assert_eq!(image_tag(&spec()).len(), TAG_LENGTH);
    }

    #[test]
    fn identity_ignores_package_order_replicas_and_slug() {
        let mut other = spec();
        other.packages.reverse();
        other.replicas = 5;
        other.slug = "renamed".to_string();
        other.id = "app-2".to_string();
        assert_eq!(image_tag(&spec()), image_tag(&other));
    }

    #[test]
    fn any_identity_field_changes_the_tag() {
        let base = image_tag(&spec());

        let mut runtime = spec();
        runtime.runtime_version = "4.4.0".to_string();
        assert_ne!(base, image_tag(&runtime));

        let mut packages = spec();
        packages.packages.push("ggplot2".to_string());
        assert_ne!(base, image_tag(&packages));

        let mut branch = spec();
        branch.code_origin = CodeOrigin::Git {
            repository: "https://example.org/sales.git".to_string(),
            branch: Some("dev".to_string()),
        };
        assert_ne!(base, image_tag(&branch));

        let mut uploaded = spec();
        uploaded.code_origin = CodeOrigin::Uploaded;
        assert_ne!(base, image_tag(&uploaded));

        let mut entry = spec();
        entry.entry_point = "main.R".to_string();
        assert_ne!(base, image_tag(&entry));
    }

    #[test]
    fn dockerfile_installs_packages_only_when_declared() {
        let with_packages = dockerfile(&spec(), "rocker/r-ver", 3838);
        assert!(with_packages.starts_with("FROM rocker/r-ver:4.3.2\n"));
        assert!(with_packages.contains("install.packages(c('shiny', 'dplyr')"));
        assert!(with_packages.contains("EXPOSE 3838"));
        assert!(with_packages.contains("/dev/tcp/127.0.0.1/3838"));
        assert!(with_packages.contains("CMD [\"Rscript\",\"/srv/app/app.R\"]"));
        assert!(with_packages.contains("RUN [\"R\",\"-e\",\"install.packages("));

        let mut bare = spec();
        bare.packages.clear();
        assert!(!dockerfile(&bare, "rocker/r-ver", 3838).contains("install.packages"));
    }

    fn exec_form(dockerfile: &str, instruction: &str) -> Vec<String> {
        let line = dockerfile
            .lines()
            .find_map(|line| line.strip_prefix(instruction))
            .unwrap();
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn quotes_and_backslashes_stay_inside_their_arguments() {
        let mut odd = spec();
        odd.entry_point = "dir \"x\"\\app.R".to_string();
        odd.packages = vec!["it's".to_string(), "back\\slash\"".to_string()];
        let rendered = dockerfile(&odd, "rocker/r-ver", 3838);

        assert_eq!(
            exec_form(&rendered, "CMD "),
            vec!["Rscript".to_string(), "/srv/app/dir \"x\"\\app.R".to_string()]
        );
        let run = exec_form(&rendered, "RUN ");
        assert_eq!(run.len(), 3);
        assert_eq!(
            run[2],
            "install.packages(c('it\\'s', 'back\\\\slash\"'), repos='https://cloud.r-project.org')"
        );
    }

    #[test]
    fn image_name_joins_prefix_and_slug() {
        assert_eq!(image_name("shinydock", "sales"), "shinydock-sales");
    }
}
