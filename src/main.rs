#[macro_use]
extern crate rocket;

use std::env;
use std::sync::Arc;

use dotenv::dotenv;
use env_logger::Env;
use image_interceptor::api;
use image_interceptor::blobs::BlobRegistry;
use image_interceptor::config::AppConfig;
use image_interceptor::cors::CORS;
use image_interceptor::images::{FsFetcher, HttpFetcher, ImageFetcher};
use image_interceptor::interceptor::{install, ImageCompressionService, LoaderSlot, Teardown};
use log::{info, warn};
use rocket::{
    fairing::AdHoc,
    figment::{
        providers::{Format, Toml},
        Figment, Profile,
    },
    Config,
};

#[launch]
async fn rocket() -> _ {
    dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    // Load config
    let mut figment = Figment::from(Config::default())
        .merge(Toml::file("App.toml").nested());

    if let Ok(origin) = env::var("APP_ORIGIN") {
        figment = figment.merge(("compression.origin", origin));
    }

    if let Ok(static_root) = env::var("STATIC_ROOT") {
        figment = figment.merge(("static_root", static_root));
    }

    if let Ok(debug) = env::var("COMPRESSION_DEBUG") {
        figment = figment.merge(("compression.debug", debug == "1" || debug.eq_ignore_ascii_case("true")));
    }

    figment = figment.select(Profile::from_env_or("APP_PROFILE", "default"));

    let config = match figment.extract::<AppConfig>() {
        Ok(config) => config,
        Err(e) => panic!("Invalid configuration: {}", e),
    };
    info!("Configuration loaded successfully");

    // Local images come from disk when a static root is configured, over HTTP otherwise
    let fetcher: Arc<dyn ImageFetcher> = match &config.static_root {
        Some(root) => {
            info!("Reading local images from {}", root);
            Arc::new(FsFetcher::new(root))
        }
        None => {
            info!("Fetching local images from {}", config.compression.origin);
            if config.fetches_from_self() {
                warn!(
                    "Origin {} is this server, which serves no images. Set APP_ORIGIN to the site or STATIC_ROOT to its files",
                    config.compression.origin
                );
            }
            match HttpFetcher::new(config.timeout) {
                Ok(fetcher) => Arc::new(fetcher),
                Err(e) => panic!("Failed to build HTTP client: {}", e),
            }
        }
    };

    let blobs = Arc::new(BlobRegistry::new(&config.compression.origin));

    let service = match ImageCompressionService::new(config.compression.clone(), fetcher, blobs.clone()) {
        Ok(service) => service,
        Err(e) => panic!("Invalid compression configuration: {}", e),
    };
    info!(
        "Image compression enabled (quality {}, max {}x{}, min {}x{})",
        config.compression.quality,
        config.compression.max_width,
        config.compression.max_height,
        config.compression.min_width,
        config.compression.min_height
    );

    let slot = Arc::new(LoaderSlot::new());
    let teardown = install(&slot, service.clone());

    info!("Starting image interceptor on {}:{}", config.address, config.port);

    rocket::custom(figment)
        .attach(CORS)
        .attach(AdHoc::on_shutdown("Image interceptor teardown", |rocket| {
            Box::pin(async move {
                if let Some(teardown) = rocket.state::<Teardown>() {
                    teardown.teardown();
                }
            })
        }))
        .manage(slot)
        .manage(service)
        .manage(blobs)
        .manage(teardown)
        .manage(config.clone())
        .mount("/images", api::image_routes())
        .mount("/blob", api::blob_routes())
}
