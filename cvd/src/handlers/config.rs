//! `cvd load` and `cvd lint` over environment specification files.

use std::path::{Path, PathBuf};

use crate::env_spec::EnvironmentSpecification;
use crate::error::CvdError;
use crate::registry::{CommandHandler, HandlerContext};
use crate::request::CommandRequest;

use super::{absolute, bad_request, host_out_from_env, nested_request};

fn config_path(request: &CommandRequest) -> Result<PathBuf, CvdError> {
    match request.subcommand_args() {
        [path] => absolute(Path::new(path)),
        [] => Err(bad_request(format!("cvd {} needs a configuration file", request.subcommand().unwrap_or_default()))),
        [_, extra, ..] => Err(bad_request(format!("unexpected argument \"{extra}\""))),
    }
}

fn load_valid(path: &Path) -> Result<EnvironmentSpecification, CvdError> {
    let spec = EnvironmentSpecification::load(path)?;
    spec.validate().map_err(|e| e.context(path.display().to_string()))?;
    Ok(spec)
}

/// The `create` arguments that realize `spec`.
///
/// # Errors
/// [`CvdError::BadRequest`] if no host tools directory is known.
pub(crate) fn create_args(spec: &EnvironmentSpecification, request: &CommandRequest) -> Result<Vec<String>, CvdError> {
    let host = spec
        .common
        .host_package
        .as_deref()
        .filter(|p| p.starts_with('/'))
        .map(PathBuf::from)
        .or_else(|| host_out_from_env(request))
        .ok_or_else(|| bad_request("configuration has no local common.host_package and ANDROID_HOST_OUT is unset"))?;
    let mut args = vec![
        "create".to_owned(),
        format!("--host_path={}", host.display()),
        format!("--num_instances={}", spec.instances.len()),
    ];
    if let Some(group) = &spec.common.group_name {
        args.push(format!("--group_name={group}"));
    }
    let names: Option<Vec<&str>> = spec.instances.iter().map(|i| i.name.as_deref()).collect();
    if let Some(names) = names {
        args.push(format!("--instance_names={}", names.join(",")));
    }
    if let Some(image_dir) = spec.instances.iter().find_map(|i| i.local_image_dir()) {
        args.push(format!("--product_path={}", image_dir.display()));
    }
    Ok(args)
}

/// `cvd load <file>`: create and start the group a file describes.
pub struct LoadConfigsHandler;

impl CommandHandler for LoadConfigsHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["load", "load-configs"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        let spec = load_valid(&config_path(request)?)?;
        let create = nested_request(request, create_args(&spec, request)?, Vec::new())?;
        ctx.execute(std::slice::from_ref(&create))
    }

    fn summary_help(&self) -> String {
        "Create and start a group described by a JSON configuration".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd load <config.json>\n\n\
         Reads an environment specification ({\"common\": {...}, \"instances\": [...]})\n\
         and runs cvd create with one instance per configured instance.\n"
            .to_owned()
    }
}

/// `cvd lint <file>`: validate a configuration without touching the host.
pub struct LintHandler;

impl CommandHandler for LintHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["lint"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        let path = config_path(request)?;
        let spec = load_valid(&path)?;
        ctx.println(&format!("{}: {} instance(s), no issues found", path.display(), spec.instances.len()))
    }

    fn summary_help(&self) -> String {
        "Check a JSON configuration for errors".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd lint <config.json>\n\nParses and validates the configuration; nothing is created.\n".to_owned()
    }
}
