//! `cvd create`: register a new group and, by default, start it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cvd_core::{gen_default_group_name, Group, MAX_INSTANCES};
use cvd_instances::{CreateGroupParams, InstanceManager, InstanceParams, Query};
use tracing::info;

use crate::error::CvdError;
use crate::registry::{CommandHandler, HandlerContext};
use crate::request::CommandRequest;
use crate::selector::GROUP_NAME_FLAG;

use super::status::{print_json, GroupStatus};
use super::{absolute, bad_request, host_out_from_env, nested_request, Flags, ANDROID_PRODUCT_OUT};

const VALUE_FLAGS: &[&str] =
    &["host_path", "product_path", "num_instances", "instance_nums", "instance_names", "group_name", "build_id"];
const BOOL_FLAGS: &[&str] = &["start"];

pub struct CreateHandler {
    manager: Arc<InstanceManager>,
}

impl CreateHandler {
    #[must_use]
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }

    fn group_name(&self, request: &CommandRequest, flags: &Flags) -> Result<Option<String>, CvdError> {
        let from_flag = flags.value("group_name").map(str::to_owned);
        let from_selector = request.selectors().group_name.clone();
        match (from_flag, from_selector) {
            (Some(a), Some(b)) if a != b => Err(bad_request(format!("--group_name={a} conflicts with -group_name {b}"))),
            (Some(name), _) | (None, Some(name)) => Ok(Some(name)),
            (None, None) => {
                let default = gen_default_group_name();
                let taken = !self.manager.database().find_groups(&Query::by_group_name(&default))?.is_empty();
                Ok((!taken).then_some(default))
            }
        }
    }

    fn params(&self, request: &CommandRequest, flags: &Flags) -> Result<CreateGroupParams, CvdError> {
        let host = match flags.value("host_path") {
            Some(path) => PathBuf::from(path),
            None => host_out_from_env(request)
                .ok_or_else(|| bad_request("no host artifacts: pass --host_path or set ANDROID_HOST_OUT"))?,
        };
        let product = flags
            .value("product_path")
            .or_else(|| request.env_var(ANDROID_PRODUCT_OUT))
            .filter(|p| !p.is_empty())
            .map(|p| absolute(Path::new(p)))
            .transpose()?;

        let instances = instance_params(request, flags)?;
        let mut params = CreateGroupParams::new(absolute(&host)?, instances);
        params.group_name = self.group_name(request, flags)?;
        params.product_out_path = product;
        params.build_id = flags.value("build_id").map(str::to_owned);
        Ok(params)
    }
}

/// Zip `--instance_nums` and the instance names into per-instance params,
/// sized by `--num_instances` when given.
fn instance_params(request: &CommandRequest, flags: &Flags) -> Result<Vec<InstanceParams>, CvdError> {
    let ids = flags
        .list("instance_nums")
        .iter()
        .map(|n| n.parse::<u32>().map_err(|e| bad_request(format!("--instance_nums entry \"{n}\": {e}"))))
        .collect::<Result<Vec<u32>, _>>()?;
    let names = match (flags.list("instance_names"), &request.selectors().instance_names) {
        (names, _) if !names.is_empty() => names,
        (_, Some(names)) => names.clone(),
        (_, None) => Vec::new(),
    };
    if !ids.is_empty() && !names.is_empty() && ids.len() != names.len() {
        return Err(bad_request(format!("{} instance ids but {} instance names", ids.len(), names.len())));
    }
    let listed = ids.len().max(names.len());
    let count = match flags.u32("num_instances")? {
        Some(0) => return Err(bad_request("--num_instances must be at least 1")),
        Some(n) if n > MAX_INSTANCES => {
            return Err(bad_request(format!("--num_instances={n} exceeds the host limit of {MAX_INSTANCES}")))
        }
        Some(n) => {
            let n = n as usize;
            if listed != 0 && listed != n {
                return Err(bad_request(format!("--num_instances={n} but {listed} instances listed")));
            }
            n
        }
        None => listed.max(1),
    };
    if count > MAX_INSTANCES as usize {
        return Err(bad_request(format!("{count} instances listed; the host limit is {MAX_INSTANCES}")));
    }
    Ok((0..count)
        .map(|i| InstanceParams::new(ids.get(i).copied(), names.get(i).cloned()))
        .collect())
}

impl CommandHandler for CreateHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["create"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        let flags = Flags::parse(request.subcommand_args(), VALUE_FLAGS, BOOL_FLAGS)?;
        if let Some(extra) = flags.positional.first() {
            return Err(bad_request(format!("unexpected argument \"{extra}\"")));
        }
        let group: Group = self.manager.create_group(self.params(request, &flags)?)?;
        info!(group = %group.name(), instances = group.instances().len(), "group created");

        let group = if flags.flag("start").unwrap_or(true) {
            let start = nested_request(
                request,
                ["start"],
                vec![format!("-{GROUP_NAME_FLAG}"), group.name().to_owned()],
            )?;
            ctx.execute(std::slice::from_ref(&start))?;
            self.manager.group(group.name())?
        } else {
            group
        };
        print_json(ctx, &GroupStatus::new(&group))
    }

    fn summary_help(&self) -> String {
        "Create a new instance group and start it".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd create [--host_path DIR] [--product_path DIR] [--group_name NAME]\n\
         \x20                 [--num_instances N] [--instance_nums ID,...] [--instance_names NAME,...]\n\
         \x20                 [--build_id ID] [--[no]start]\n\n\
         Registers a group whose host tools live in --host_path (default\n\
         $ANDROID_HOST_OUT, then $ANDROID_SOONG_HOST_OUT) and images in\n\
         --product_path (default $ANDROID_PRODUCT_OUT). Listed instance ids are\n\
         reserved first; the rest get the smallest free id. The group is\n\
         started unless --nostart is given. Prints the group as JSON.\n"
            .to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(args: &[&str], selectors: &[&str]) -> CommandRequest {
        match CommandRequest::builder()
            .add_arguments(["cvd", "create"])
            .add_arguments(args.iter().copied())
            .add_selector_arguments(selectors.iter().copied())
            .build()
        {
            Ok(r) => r,
            Err(e) => panic!("build failed: {e}"),
        }
    }

    fn params(args: &[&str], selectors: &[&str]) -> Result<Vec<InstanceParams>, CvdError> {
        let req = request(args, selectors);
        let flags = Flags::parse(req.subcommand_args(), VALUE_FLAGS, BOOL_FLAGS)?;
        instance_params(&req, &flags)
    }

    #[test]
    fn ids_and_names_are_zipped() {
        let got = match params(&["--instance_nums=3,4", "--instance_names=a,b"], &[]) {
            Ok(p) => p,
            Err(e) => panic!("params failed: {e}"),
        };
        assert_eq!(
            got,
            vec![
                InstanceParams::new(Some(3), Some("a".to_owned())),
                InstanceParams::new(Some(4), Some("b".to_owned()))
            ]
        );
    }

    #[test]
    fn selector_names_apply_when_flag_absent() {
        let got = match params(&[], &["-instance_name", "x,y"]) {
            Ok(p) => p,
            Err(e) => panic!("params failed: {e}"),
        };
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].name.as_deref(), Some("y"));
    }

    #[test]
    fn count_defaults_to_one_and_must_agree_with_lists() {
        assert_eq!(params(&[], &[]).map(|p| p.len()).ok(), Some(1));
        assert_eq!(params(&["--num_instances=3"], &[]).map(|p| p.len()).ok(), Some(3));
        assert!(params(&["--num_instances=2", "--instance_nums=1"], &[]).is_err());
        assert!(params(&["--num_instances=0"], &[]).is_err());
        assert!(matches!(params(&["--num_instances=4294967295"], &[]), Err(CvdError::BadRequest(_))));
        assert!(params(&["--num_instances=129"], &[]).is_err());
        assert_eq!(params(&["--num_instances=128"], &[]).map(|p| p.len()).ok(), Some(128));
        assert!(params(&["--instance_nums=1,2", "--instance_names=a"], &[]).is_err());
        assert!(params(&["--instance_nums=x"], &[]).is_err());
    }
}
