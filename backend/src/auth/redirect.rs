use actix_web::{HttpRequest, HttpResponse, http::header, web};
use shared::Role;

use super::jwt::JwtService;
use super::middleware::validate_request_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    Unauthenticated,
    Authenticated(Role),
}

/// Where a visitor lands after sign-in, by session.
pub fn landing_route(session: Session) -> &'static str {
    match session {
        Session::Unauthenticated => "/login",
        Session::Authenticated(Role::Patient) => "/patient/dashboard",
        Session::Authenticated(Role::Doctor) => "/doctor/dashboard",
        Session::Authenticated(Role::Admin) => "/admin/dashboard",
    }
}

pub async fn landing(req: HttpRequest, jwt_service: web::Data<JwtService>) -> HttpResponse {
    let session = match validate_request_token(&req, &jwt_service) {
        Ok(user) => Session::Authenticated(user.role),
        Err(_) => Session::Unauthenticated,
    };
    let location = landing_route(session);
    log::debug!("Landing redirect for {:?}: {}", session, location);
    HttpResponse::Found()
        .insert_header((header::LOCATION, location))
        .finish()
}
