pub mod error;
pub mod images;

pub use error::ApiError;

use rocket::Route;

pub fn image_routes() -> Vec<Route> {
    routes![
        images::resolve_image,
        images::resolve_images,
        images::get_stats,
        images::opt_out_url,
    ]
}

pub fn blob_routes() -> Vec<Route> {
    routes![images::get_blob]
}
