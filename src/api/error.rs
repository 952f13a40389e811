use rocket::http::Status;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Timeout(String),
}

impl ApiError {
    fn parts(&self) -> (Status, &'static str, &str) {
        match self {
            ApiError::NotFound(message) => (Status::NotFound, "Not found", message),
            ApiError::BadRequest(message) => (Status::BadRequest, "Bad request", message),
            ApiError::Timeout(message) => (Status::GatewayTimeout, "Timed out", message),
        }
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let (status, error, message) = self.parts();
        let body = json!({
            "error": error,
            "message": message
        })
        .to_string();

        rocket::Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(body.len(), std::io::Cursor::new(body))
            .ok()
    }
}
