//! The per-deployment graph: modules, their runtimes, endpoints, mounts and
//! function links, plus the interpretation of one function's output into the
//! next function's input.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wasmtime::Val;

use crate::error::{MountError, SupervisorError};
use crate::model::endpoint::{Endpoint, EndpointResponse};
use crate::model::module::ModuleConfig;
use crate::model::mount::{MountPathFile, MountStage, StageMounts};
use crate::util::constants::FILE_TYPES;
use crate::wasm::runtime::{coerce_arg, WasmtimeRuntime};

pub type FunctionEndpointMap = HashMap<String, Endpoint>;
pub type ModuleEndpointMap = HashMap<String, FunctionEndpointMap>;
pub type ModuleLinkMap = HashMap<String, HashMap<String, FunctionLink>>;
pub type ModuleMountMap = HashMap<String, HashMap<String, StageMounts>>;

/// How a function's output is wired onward: the producing endpoint on this
/// device and, optionally, the consuming endpoint elsewhere. `to = None`
/// means the chain terminates here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionLink {
    pub from: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Endpoint>,
}

/// The `instructions` document as the orchestrator sends it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstructionsDoc {
    #[serde(default)]
    pub modules: ModuleLinkMap,
}

/// Arguments for the next endpoint, shaped by what the current call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointArgs {
    /// A single primitive, passed as the first declared parameter.
    Scalar(String),
    /// Positional values zipped with the declared parameters.
    Ordered(Vec<String>),
    /// Values matched to declared parameters by name.
    Keyed(IndexMap<String, String>),
}

/// Interpreted output of one call: arguments and output-mount names for the
/// next endpoint, either of which may be absent.
pub type EndpointOutput = (Option<EndpointArgs>, Option<Vec<String>>);

/// A fully resolved request against a remote endpoint: URL with query,
/// method, headers and the mount names of files to attach. The actual file
/// contents are opened only when the call is made.
#[derive(Debug, Clone, PartialEq)]
pub struct CallData {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub method: String,
    pub files: Vec<String>,
}

impl CallData {
    /// Fill in an endpoint's parameters with the given arguments and files.
    pub fn from_endpoint(
        endpoint: &Endpoint,
        args: Option<&EndpointArgs>,
        files: Option<&[String]>,
    ) -> Result<Self, SupervisorError> {
        let mut url = format!("{}{}", endpoint.url.trim_end_matches('/'), endpoint.path);

        if let Some(args) = args {
            let parameters = &endpoint.request.parameters;
            let pairs: Vec<(String, String)> = match args {
                EndpointArgs::Scalar(value) => {
                    let first = parameters.first().ok_or_else(|| {
                        SupervisorError::Descriptor(
                            "scalar argument but endpoint declares no parameters".to_string(),
                        )
                    })?;
                    vec![(first.name.clone(), value.clone())]
                }
                EndpointArgs::Ordered(values) => parameters
                    .iter()
                    .zip(values.iter())
                    .map(|(p, v)| (p.name.clone(), v.clone()))
                    .collect(),
                EndpointArgs::Keyed(map) => parameters
                    .iter()
                    .map(|p| {
                        map.get(&p.name)
                            .map(|v| (p.name.clone(), v.clone()))
                            .ok_or_else(|| {
                                SupervisorError::Descriptor(format!(
                                    "no value for declared parameter '{}'",
                                    p.name
                                ))
                            })
                    })
                    .collect::<Result<_, _>>()?,
            };
            if !pairs.is_empty() {
                let query = serde_urlencoded::to_string(&pairs).map_err(|e| {
                    SupervisorError::Descriptor(format!("could not encode query: {}", e))
                })?;
                url.push('?');
                url.push_str(&query);
            }
        }

        Ok(Self {
            url,
            headers: HashMap::new(),
            method: endpoint.method.clone(),
            files: files.map(<[String]>::to_vec).unwrap_or_default(),
        })
    }
}

/// Transform a function's raw output into the declared shape of its
/// endpoint's response.
///
/// - `application/json` with an integer schema: the primitive is JSON-encoded
///   and forwarded as an argument.
/// - A supported binary media type: the result was written through WASI into
///   the single declared output mount, whose name is forwarded.
pub fn parse_endpoint_result(
    wasm_output: &Value,
    response: &EndpointResponse,
    output_mounts: &[MountPathFile],
) -> Result<EndpointOutput, SupervisorError> {
    if response.media_type == "application/json" {
        let primitive = response
            .schema
            .as_ref()
            .map(|schema| schema.is_wasm_primitive())
            .unwrap_or(false);
        if primitive {
            return Ok((Some(EndpointArgs::Scalar(wasm_output.to_string())), None));
        }
        return Err(SupervisorError::Descriptor(
            "non-primitive JSON output is not supported".to_string(),
        ));
    }
    if FILE_TYPES.contains(&response.media_type.as_str()) {
        if output_mounts.len() != 1 {
            return Err(SupervisorError::Descriptor(format!(
                "exactly one output file expected for media type \"{}\", found {}",
                response.media_type,
                output_mounts.len()
            )));
        }
        return Ok((None, Some(vec![output_mounts[0].path.clone()])));
    }
    Err(SupervisorError::Descriptor(format!(
        "unsupported response media type \"{}\"",
        response.media_type
    )))
}

/// Describes how HTTP endpoints map to the environment, parameters and
/// execution of WebAssembly functions within one deployment.
#[derive(Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub modules: HashMap<String, ModuleConfig>,
    pub endpoints: ModuleEndpointMap,
    pub links: ModuleLinkMap,
    pub mounts: ModuleMountMap,
    #[serde(skip)]
    pub runtimes: HashMap<String, WasmtimeRuntime>,
    #[serde(skip)]
    params_root: PathBuf,
}

impl Deployment {
    /// Build and validate the deployment graph. Runtimes are created
    /// separately with [`Deployment::init_runtimes`].
    pub fn from_parts(
        id: String,
        module_configs: Vec<ModuleConfig>,
        endpoints: ModuleEndpointMap,
        instructions: InstructionsDoc,
        mut mounts: ModuleMountMap,
        params_root: PathBuf,
    ) -> Result<Self, SupervisorError> {
        let mut modules = HashMap::new();
        for config in module_configs {
            if modules.insert(config.name.clone(), config).is_some() {
                return Err(SupervisorError::Descriptor(
                    "two modules share the same name".to_string(),
                ));
            }
        }

        // Every module referenced anywhere must be part of the deployment.
        let referenced = endpoints
            .keys()
            .chain(mounts.keys())
            .chain(instructions.modules.keys());
        for module_name in referenced {
            if !modules.contains_key(module_name) {
                return Err(SupervisorError::Descriptor(format!(
                    "module '{}' is referenced but not listed in the deployment",
                    module_name
                )));
            }
        }

        for functions in mounts.values_mut() {
            for stage_mounts in functions.values_mut() {
                stage_mounts.normalize()?;
            }
        }

        // Every endpoint function gets a mount entry, with empty stage lists
        // when the descriptor declared none.
        for (module_name, functions) in &endpoints {
            let function_mounts = mounts.entry(module_name.clone()).or_default();
            for function_name in functions.keys() {
                function_mounts.entry(function_name.clone()).or_default();
            }
        }

        Ok(Self {
            id,
            modules,
            endpoints,
            links: instructions.modules,
            mounts,
            runtimes: HashMap::new(),
            params_root,
        })
    }

    /// Re-initialize a deployment loaded from its persisted descriptor.
    pub fn init(&mut self, params_root: PathBuf) -> Result<(), SupervisorError> {
        self.params_root = params_root;
        self.init_runtimes()
    }

    /// Create one isolated runtime per module, each preopening only that
    /// module's mount root.
    pub fn init_runtimes(&mut self) -> Result<(), SupervisorError> {
        for name in self.modules.keys() {
            if self.runtimes.contains_key(name) {
                continue;
            }
            let mount_root = self.params_root.join(name);
            let runtime = WasmtimeRuntime::new(&mount_root)?;
            self.runtimes.insert(name.clone(), runtime);
        }
        Ok(())
    }

    /// The endpoint a function's output is to be sent to next, if any.
    pub fn next_target(&self, module_name: &str, function_name: &str) -> Option<&Endpoint> {
        self.links
            .get(module_name)
            .and_then(|functions| functions.get(function_name))
            .and_then(|link| link.to.as_ref())
    }

    fn endpoint(&self, module_name: &str, function_name: &str) -> Result<&Endpoint, SupervisorError> {
        self.endpoints
            .get(module_name)
            .and_then(|functions| functions.get(function_name))
            .ok_or_else(|| {
                SupervisorError::Invocation(format!(
                    "no endpoint declared for '{}/{}'",
                    module_name, function_name
                ))
            })
    }

    fn stage_mounts(&self, module_name: &str, function_name: &str) -> StageMounts {
        self.mounts
            .get(module_name)
            .and_then(|functions| functions.get(function_name))
            .cloned()
            .unwrap_or_default()
    }

    /// Figure out what a function needs as input and set its environment up:
    /// load the module, coerce the query arguments into typed primitives in
    /// declaration order, and reconcile declared mounts with the files at
    /// hand for this run.
    pub fn prepare_for_running(
        &mut self,
        module_name: &str,
        function_name: &str,
        args: &IndexMap<String, String>,
        request_filepaths: &HashMap<String, String>,
    ) -> Result<Vec<Val>, SupervisorError> {
        let config = self
            .modules
            .get(module_name)
            .ok_or_else(|| {
                SupervisorError::Invocation(format!(
                    "module '{}' is not part of deployment '{}'",
                    module_name, self.id
                ))
            })?
            .clone();
        let parameter_names: Vec<String> = self
            .endpoint(module_name, function_name)?
            .request
            .parameters
            .iter()
            .map(|p| p.name.clone())
            .collect();

        let runtime = self.runtimes.get_mut(module_name).ok_or_else(|| {
            SupervisorError::ModuleLoad(format!("no runtime for module '{}'", module_name))
        })?;
        runtime.get_or_load(&config.name, &config.path)?;

        let types = runtime.arg_types(module_name, function_name)?;
        if parameter_names.len() < types.len() {
            return Err(SupervisorError::Invocation(format!(
                "'{}' takes {} argument(s) but only {} parameter(s) are declared",
                function_name,
                types.len(),
                parameter_names.len()
            )));
        }
        let mut wasm_args = Vec::with_capacity(types.len());
        for (name, ty) in parameter_names.iter().zip(types.iter()) {
            let raw = args.get(name).ok_or_else(|| {
                SupervisorError::Invocation(format!("missing argument '{}'", name))
            })?;
            wasm_args.push(coerce_arg(raw, ty)?);
        }

        self.connect_request_files_to_mounts(module_name, function_name, request_filepaths)?;

        Ok(wasm_args)
    }

    /// Check the validity of the files received for this run and copy every
    /// input mount to its canonical place under the module's mount root.
    fn connect_request_files_to_mounts(
        &self,
        module_name: &str,
        function_name: &str,
        request_filepaths: &HashMap<String, String>,
    ) -> Result<(), SupervisorError> {
        let mounts = self.stage_mounts(module_name, function_name);

        let deployment_paths: HashSet<&str> =
            mounts.deployment.iter().map(|m| m.path.as_str()).collect();
        let execution_paths: HashSet<&str> =
            mounts.execution.iter().map(|m| m.path.as_str()).collect();

        for request_path in request_filepaths.keys() {
            if !execution_paths.contains(request_path.as_str()) {
                return Err(MountError::UnexpectedInputFile(request_path.clone()).into());
            }
            // Deployment-stage files must not be overwritten by uploads.
            if deployment_paths.contains(request_path.as_str()) {
                return Err(MountError::DuplicateMount(request_path.clone()).into());
            }
        }

        let received: HashSet<&str> = deployment_paths
            .iter()
            .copied()
            .chain(request_filepaths.keys().map(String::as_str))
            .collect();
        for mount in mounts.deployment.iter().chain(mounts.execution.iter()) {
            if mount.required && !received.contains(mount.path.as_str()) {
                return Err(MountError::MissingInputFile(mount.path.clone()).into());
            }
        }

        // Output mounts are produced by the call itself; only input stages
        // are materialised here.
        let module_config = &self.modules[module_name];
        for mount in mounts.execution.iter().chain(mounts.deployment.iter()) {
            let source: Option<PathBuf> = match mount.stage {
                Some(MountStage::Deployment) => {
                    module_config.data_files.get(&mount.path).cloned()
                }
                Some(MountStage::Execution) => {
                    request_filepaths.get(&mount.path).map(PathBuf::from)
                }
                _ => None,
            };
            let Some(source) = source else {
                if mount.required {
                    return Err(MountError::MissingInputFile(mount.path.clone()).into());
                }
                continue;
            };

            let host_path = self.params_root.join(module_name).join(&mount.path);
            if source != host_path {
                if let Some(parent) = host_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&source, &host_path)?;
            } else {
                debug!("File already at mount location: {}", host_path.display());
            }
        }

        Ok(())
    }

    /// Interpret the raw output of the given function against its endpoint's
    /// declared response, and build the data for the next call when the
    /// function is linked onward.
    pub fn interpret_call_from(
        &self,
        module_name: &str,
        function_name: &str,
        wasm_output: &Value,
    ) -> Result<(EndpointOutput, Option<CallData>), SupervisorError> {
        let endpoint = self.endpoint(module_name, function_name)?;
        let mounts = self.stage_mounts(module_name, function_name);
        let (next_args, next_files) =
            parse_endpoint_result(wasm_output, &endpoint.response, &mounts.output)?;

        let next_call = match self.next_target(module_name, function_name) {
            Some(next_endpoint) => Some(CallData::from_endpoint(
                next_endpoint,
                next_args.as_ref(),
                next_files.as_deref(),
            )?),
            None => None,
        };
        Ok(((next_args, next_files), next_call))
    }
}
