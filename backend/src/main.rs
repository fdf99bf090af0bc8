mod auth;
mod config;
mod db;
mod error;
mod inference;
mod model;
mod pipeline;
mod report;
mod routes;
mod storage;
#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use auth::jwt::JwtService;
use auth::middleware::AuthMiddleware;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use aws_sdk_s3::Client as S3Client;
use config::{AppConfig, StorageConfig};
use db::dynamodb_repository::DynamoDbRepository;
use db::persister::MetadataPersister;
use inference::client::HttpInferenceClient;
use inference::invoker::AnalysisInvoker;
use pipeline::coordinator::SubmissionCoordinator;
use report::assembler::ReportAssembler;
use routes::configure_routes;
use std::sync::Arc;
use storage::s3_service::S3Service;
use storage::uploader::ObjectStoreUploader;

async fn load_aws_config(storage: &StorageConfig) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(storage.region.clone()));
    if let (Some(access_key), Some(secret_key)) =
        (&storage.access_key_id, &storage.secret_access_key)
    {
        loader = loader.credentials_provider(Credentials::new(
            access_key.clone(),
            secret_key.clone(),
            None,
            None,
            "screening-config",
        ));
    }
    loader.load().await
}

fn s3_client(aws_config: &aws_config::SdkConfig, storage: &StorageConfig) -> S3Client {
    match &storage.endpoint_url {
        Some(endpoint) => {
            // S3-compatible providers expect path-style addressing.
            let s3_config = aws_sdk_s3::config::Builder::from(aws_config)
                .endpoint_url(endpoint)
                .force_path_style(true)
                .build();
            S3Client::from_conf(s3_config)
        }
        None => S3Client::new(aws_config),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        log::error!("Configuration error: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let aws_config = load_aws_config(&config.storage).await;
    let dynamodb_client = DynamoDbClient::new(&aws_config);
    let s3_client = s3_client(&aws_config, &config.storage);

    let s3_service = S3Service::new(
        s3_client,
        config.storage.bucket.clone(),
        &config.storage.region,
        config.storage.public_base_url.clone(),
    );
    let db_repo = Arc::new(DynamoDbRepository::new(
        dynamodb_client,
        config.tables.submissions_table.clone(),
        config.tables.provenance_table.clone(),
    ));
    let inference_client = HttpInferenceClient::new(&config.inference).map_err(|e| {
        log::error!("Failed to build inference client: {}", e);
        std::io::Error::other(e.to_string())
    })?;

    let coordinator = web::Data::new(SubmissionCoordinator::new(
        ObjectStoreUploader::new(Arc::new(s3_service), config.upload.clone()),
        AnalysisInvoker::new(Arc::new(inference_client), config.inference.timeout),
        ReportAssembler::new(config.report.clone()),
        MetadataPersister::new(db_repo.clone()),
        db_repo,
        &config.pipeline,
    ));

    let jwt_service = Arc::new(JwtService::new(&config.jwt_secret));
    let auth_middleware = AuthMiddleware::new(jwt_service.clone());

    log::info!(
        "Pipeline ready: bucket {}, at most {} submission(s) in flight",
        config.storage.bucket,
        config.pipeline.max_in_flight
    );

    let bind_address = format!("0.0.0.0:{}", config.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::AUTHORIZATION,
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(coordinator.clone())
            .app_data(web::Data::from(jwt_service.clone()))
            .configure(|cfg| configure_routes(cfg, auth_middleware.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await
}
