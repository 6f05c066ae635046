use poem::{http::StatusCode, web::Json, Error, IntoResponse, Response, Result};
use serde::Serialize;
use serde_json::Value;

/// JSON rendering options for the HTTP/JSON gateway side of the server.
///
/// The server attaches these as request data on the HTTP branch, so gateway
/// handlers can pick them up with `poem::web::Data<&JsonOptions>`.
///
/// # Examples
///
/// ```rust,ignore
/// #[poem::handler]
/// fn get_user(Data(json): Data<&JsonOptions>) -> poem::Result<poem::Response> {
///     json.render(&load_user())
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonOptions {
    /// Keep fields holding unpopulated values (`null`, `""`, `0`, `false`,
    /// `[]`, `{}`) instead of omitting them.
    ///
    /// Omission applies at every object level. Map entries with zero values
    /// and empty nested objects are dropped as well, which is stricter than
    /// protobuf JSON; set this flag when such entries must be kept.
    pub emit_unpopulated: bool,
}

impl JsonOptions {
    /// Converts `value` to JSON, omitting unpopulated fields unless
    /// [`emit_unpopulated`](Self::emit_unpopulated) is set.
    pub fn to_value<T: Serialize>(&self, value: &T) -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(value)?;
        if !self.emit_unpopulated {
            prune_unpopulated(&mut value);
        }
        Ok(value)
    }

    /// Renders `value` as an `application/json` response.
    pub fn render<T: Serialize>(&self, value: &T) -> Result<Response> {
        let value = self
            .to_value(value)
            .map_err(|err| Error::from_string(err.to_string(), StatusCode::INTERNAL_SERVER_ERROR))?;
        Ok(Json(value).into_response())
    }
}

fn is_unpopulated(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

fn prune_unpopulated(value: &mut Value) {
    match value {
        Value::Object(fields) => {
            for field in fields.values_mut() {
                prune_unpopulated(field);
            }
            fields.retain(|_, field| !is_unpopulated(field));
        }
        Value::Array(items) => items.iter_mut().for_each(prune_unpopulated),
        _ => {}
    }
}
