//! Operation catalog.
//!
//! The scheduler does not interpret backend operations. It only needs to know
//! which ones stream several results, and typed callers can declare an
//! operation's parameter and result shapes through [`ShellApi`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operations whose caller-visible result is a list of results.
pub const MULTI_RESULT_APIS: &[&str] = &[
    "gui.core.list_files",
    "gui.db.get_schema_object_names",
    "gui.dbconnections.list_db_connections",
    "gui.modules.get_profile_data_tree",
    "mrs.list.services",
    "mrs.list.schemas",
    "gui.shell.complete",
    "gui.sqleditor.execute",
];

pub fn is_multi_result(request_type: &str) -> bool {
    MULTI_RESULT_APIS.contains(&request_type)
}

/// A backend operation with declared wire shapes.
///
/// Field names are fixed by the serde derives on `Params` and `Output`, so no
/// runtime key conversion is applied to typed traffic.
pub trait ShellApi {
    const NAME: &'static str;
    const MULTI_RESULT: bool = false;

    type Params: Serialize + Send;
    type Output: DeserializeOwned;
}

/// Positional-style arguments holder used by most gui.* operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args<T> {
    pub args: T,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetBackendInformation;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendInformation {
    pub architecture: String,
    pub major: String,
    pub minor: String,
    pub patch: String,
    pub platform: String,
    pub server_distribution: String,
    pub server_major: String,
    pub server_minor: String,
    pub server_patch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendInformationResult {
    pub info: BackendInformation,
}

impl ShellApi for GetBackendInformation {
    const NAME: &'static str = "gui.core.get_backend_information";
    type Params = serde_json::Map<String, Value>;
    type Output = BackendInformationResult;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListFiles;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathArgs {
    pub path: String,
}

impl ShellApi for ListFiles {
    const NAME: &'static str = "gui.core.list_files";
    const MULTI_RESULT: bool = true;
    type Params = Args<PathArgs>;
    type Output = Vec<Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListDbConnections;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListDbConnectionsArgs {
    pub profile_id: i64,
    pub folder_path: String,
}

impl ShellApi for ListDbConnections {
    const NAME: &'static str = "gui.dbconnections.list_db_connections";
    const MULTI_RESULT: bool = true;
    type Params = Args<ListDbConnectionsArgs>;
    type Output = Vec<Value>;
}
