//! `drp_profile_param`: one parameter on a profile, plain or secure.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{into_object, required_string, string_attr, Resource};
use crate::client::models::SecureData;
use crate::client::DrpApi;
use crate::error::ProviderError;
use crate::schema::{Attribute, Schema};
use crate::secure::submitter_for;

/// The `drp_profile_param` resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileParamResource;

/// `<profile>/<name>`.
fn param_id(profile: &str, name: &str) -> String {
    format!("{}/{}", profile, name)
}

/// What to submit for a param, taken from `value` or `secure_value`.
enum Submission<'a> {
    Plain(&'a str),
    Secure(&'a str),
}

impl<'a> Submission<'a> {
    fn from_state(state: &'a Value) -> Result<Self, ProviderError> {
        match (string_attr(state, "value"), string_attr(state, "secure_value")) {
            (Some(value), None) => Ok(Self::Plain(value)),
            (None, Some(value)) => Ok(Self::Secure(value)),
            (Some(_), Some(_)) => Err(ProviderError::Validation(
                "only one of value, secure_value may be set".to_string(),
            )),
            (None, None) => Err(ProviderError::Validation(
                "one of value, secure_value must be set".to_string(),
            )),
        }
    }
}

impl ProfileParamResource {
    async fn submit(&self, api: &dyn DrpApi, state: &Value) -> Result<(), ProviderError> {
        let profile = required_string(state, "profile")?;
        let name = required_string(state, "name")?;

        let (value, secure) = match Submission::from_state(state)? {
            Submission::Plain(value) => {
                // A missing definition means the param is free-form.
                let definition = api.get_param(name).await?;
                if definition.is_some_and(|param| param.secure) {
                    return Err(ProviderError::Validation(format!(
                        "param {} is secure, use secure_value instead",
                        name
                    )));
                }
                (value, false)
            },
            Submission::Secure(value) => (value, true),
        };

        debug!(profile, name, secure, "setting profile param");
        submitter_for(secure)
            .submit(api, profile, name, value)
            .await
    }
}

#[async_trait]
impl Resource for ProfileParamResource {
    fn type_name(&self) -> &'static str {
        "drp_profile_param"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("A parameter set on a DRP profile")
            .with_attribute(
                "profile",
                Attribute::required_string()
                    .with_description("Profile name")
                    .with_force_new(),
            )
            .with_attribute(
                "name",
                Attribute::required_string()
                    .with_description("Param name")
                    .with_force_new(),
            )
            .with_attribute(
                "value",
                Attribute::optional_string().with_description("Param value"),
            )
            .with_attribute(
                "secure_value",
                Attribute::optional_string()
                    .with_description("Param value, sealed for the profile before it is sent")
                    .sensitive(),
            )
            .with_attribute("id", Attribute::computed_string())
            .with_exactly_one_of(&["value", "secure_value"])
    }

    async fn create(&self, api: &dyn DrpApi, planned: Value) -> Result<Value, ProviderError> {
        self.submit(api, &planned).await?;

        let id = param_id(
            required_string(&planned, "profile")?,
            required_string(&planned, "name")?,
        );
        info!(id = %id, "created profile param");

        let mut state = into_object(planned)?;
        state.insert("id".into(), json!(id));
        self.read(api, Value::Object(state)).await
    }

    async fn read(&self, api: &dyn DrpApi, current: Value) -> Result<Value, ProviderError> {
        let profile = required_string(&current, "profile")?.to_string();
        let name = required_string(&current, "name")?.to_string();
        let secure = string_attr(&current, "secure_value").is_some();
        let remote = api.get_profile_param(&profile, &name).await?;

        let mut state = into_object(current)?;
        state.insert("id".into(), json!(param_id(&profile, &name)));
        // Secure values come back sealed and cannot be compared.
        let sealed = serde_json::from_value::<SecureData>(remote.clone()).is_ok();
        if !secure && !sealed {
            let value = match remote {
                Value::String(s) => s,
                other => other.to_string(),
            };
            state.insert("value".into(), Value::String(value));
        }
        Ok(Value::Object(state))
    }

    async fn update(
        &self,
        api: &dyn DrpApi,
        _prior: Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        self.submit(api, &planned).await?;
        self.read(api, planned).await
    }

    async fn delete(&self, api: &dyn DrpApi, current: Value) -> Result<(), ProviderError> {
        let profile = required_string(&current, "profile")?;
        let name = required_string(&current, "name")?;
        api.delete_profile_param(profile, name).await?;
        info!(profile, name, "deleted profile param");
        Ok(())
    }

    async fn import(&self, api: &dyn DrpApi, id: &str) -> Result<Value, ProviderError> {
        let (profile, name) = id
            .split_once('/')
            .filter(|(profile, name)| !profile.is_empty() && !name.is_empty())
            .ok_or_else(|| {
                ProviderError::Validation(format!(
                    "import id must be <profile>/<name>, got {:?}",
                    id
                ))
            })?;

        let mut state = Map::new();
        state.insert("profile".into(), json!(profile));
        state.insert("name".into(), json!(name));
        self.read(api, Value::Object(state)).await
    }
}
