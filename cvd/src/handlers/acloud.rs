//! Compatibility with the `acloud create` command line.
//!
//! Only local devices are supported:
//! `acloud create --local-instance [N] [--local-image [DIR]]`.

use crate::error::CvdError;
use crate::registry::{CommandHandler, HandlerContext};
use crate::request::CommandRequest;

use super::{bad_request, host_out_from_env, nested_request, ANDROID_HOST_OUT};

#[derive(Debug, Default, PartialEq, Eq)]
struct AcloudFlags {
    /// `Some(None)` when given without an instance number.
    local_instance: Option<Option<u32>>,
    local_image: Option<Option<String>>,
}

fn parse_acloud_flags(args: &[String]) -> Result<AcloudFlags, CvdError> {
    let mut flags = AcloudFlags::default();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let (name, inline) = match arg.split_once('=') {
            Some((name, value)) => (name.replace('_', "-"), Some(value.to_owned())),
            None => (arg.replace('_', "-"), None),
        };
        // Both flags take an optional value: an inline one, or a following
        // argument that is not itself a flag.
        let value = inline.or_else(|| iter.next_if(|next| !next.starts_with('-')).cloned());
        match name.as_str() {
            "--local-instance" => {
                let id = value
                    .map(|v| v.parse::<u32>().map_err(|e| bad_request(format!("--local-instance \"{v}\": {e}"))))
                    .transpose()?;
                flags.local_instance = Some(id);
            }
            "--local-image" => flags.local_image = Some(value),
            _ => return Err(bad_request(format!("acloud flag \"{arg}\" is not supported"))),
        }
    }
    Ok(flags)
}

/// Translate `cvd acloud create ...` (or `cvd try-acloud create ...`) into
/// the equivalent `cvd create` request.
///
/// # Errors
/// [`CvdError::BadRequest`] for anything outside the supported subset.
pub fn translate_acloud(request: &CommandRequest) -> Result<CommandRequest, CvdError> {
    let args = match request.subcommand_args() {
        [verb, rest @ ..] if verb == "create" => rest,
        [verb, ..] => return Err(bad_request(format!("acloud {verb} is not supported, only acloud create"))),
        [] => return Err(bad_request("usage: cvd acloud create --local-instance [N] [--local-image [DIR]]")),
    };
    let flags = parse_acloud_flags(args)?;
    let Some(local_instance) = flags.local_instance else {
        return Err(bad_request("only --local-instance is supported"));
    };
    let host = host_out_from_env(request).ok_or_else(|| bad_request(format!("missing {ANDROID_HOST_OUT}")))?;

    let mut create = vec!["create".to_owned(), format!("--host_path={}", host.display())];
    if let Some(id) = local_instance {
        create.push(format!("--instance_nums={id}"));
    }
    if let Some(Some(dir)) = flags.local_image {
        create.push(format!("--product_path={dir}"));
    }
    nested_request(request, create, request.selector_args().to_vec())
}

/// `cvd acloud`: run the translated `create`.
pub struct AcloudHandler;

impl CommandHandler for AcloudHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["acloud"]
    }

    fn handle(&self, request: &CommandRequest, ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        let create = translate_acloud(request)?;
        ctx.execute(std::slice::from_ref(&create))
    }

    fn summary_help(&self) -> String {
        "Run a supported acloud create command line".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd acloud create --local-instance [N] [--local-image [DIR]]\n\n\
         Translated to cvd create using $ANDROID_HOST_OUT; remote devices are not supported.\n"
            .to_owned()
    }
}

/// `cvd try-acloud`: succeed only if the arguments would translate.
pub struct TryAcloudHandler;

impl CommandHandler for TryAcloudHandler {
    fn cmd_list(&self) -> Vec<&'static str> {
        vec!["try-acloud"]
    }

    fn handle(&self, request: &CommandRequest, _ctx: &mut HandlerContext<'_>) -> Result<(), CvdError> {
        translate_acloud(request).map(drop)
    }

    fn summary_help(&self) -> String {
        "Check whether an acloud command line is supported".to_owned()
    }

    fn detailed_help(&self, _: &[String]) -> String {
        "usage: cvd try-acloud create [acloud flags]\n\nExits 0 if cvd acloud would accept the same arguments.\n"
            .to_owned()
    }
}
