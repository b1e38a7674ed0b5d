use actix_web::{dev::Payload, test, FromRequest};
use serial_test::serial;
use std::env;
use tot::{
    auth::{create_jwt, Auth, Claims, Role},
    config::AppConfig,
    require_role,
};

// Helper that guarantees a sufficiently long secret for tests.
fn set_secret() {
    env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}

async fn extract(token: &str) -> Result<Auth, actix_web::Error> {
    let req = test::TestRequest::default()
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_http_request();
    let mut pl = Payload::None;
    Auth::from_request(&req, &mut pl).await
}

#[actix_web::test]
#[serial]
async fn jwt_roundtrip_ok() {
    set_secret();
    let token = create_jwt("42", "tester", vec![Role::Staff]).expect("token");
    let auth = extract(&token).await.expect("extract");
    assert_eq!(auth.0.sub, "42:tester");
    assert!(auth.0.roles.contains(&Role::Staff));
}

#[actix_web::test]
#[serial]
async fn extractor_rejects_invalid_token() {
    set_secret();
    assert!(extract("notatoken").await.is_err());

    let req = test::TestRequest::default().to_http_request();
    let mut pl = Payload::None;
    assert!(Auth::from_request(&req, &mut pl).await.is_err());
}

#[actix_web::test]
#[serial]
async fn token_signed_with_other_secret_is_rejected() {
    env::set_var("JWT_SECRET", "another-secret-that-is-32-bytes-long");
    let token = create_jwt("1", "x", vec![Role::Admin]).expect("token");
    set_secret();
    assert!(extract(&token).await.is_err());
}

#[actix_web::test]
async fn require_role_macro_enforces_roles() {
    let claims = |roles| Claims { sub: "1:a".into(), exp: usize::MAX, roles };

    fn guarded(a: Auth) -> actix_web::Result<()> {
        require_role!(a, Role::Staff | Role::Admin);
        Ok(())
    }
    assert!(guarded(Auth(claims(vec![Role::Admin]))).is_ok());
    assert!(guarded(Auth(claims(vec![Role::Staff]))).is_ok());
    assert!(guarded(Auth(claims(vec![Role::User]))).is_err());
    assert!(guarded(Auth(claims(vec![]))).is_err());
}

#[actix_web::test]
#[serial]
async fn create_jwt_preserves_composite_subject() {
    set_secret();
    let token = create_jwt("7:ann", "ignored_username", vec![Role::User]).expect("token");
    let auth = extract(&token).await.expect("extract");
    assert_eq!(auth.0.sub, "7:ann", "create_jwt should not duplicate colon subjects");
}

#[core::prelude::v1::test]
#[serial]
fn app_config_requires_long_secret() {
    env::set_var("JWT_SECRET", "short");
    assert!(AppConfig::from_env().is_err());

    set_secret();
    env::remove_var("PORT");
    env::set_var("SITE_TITLE", "Pick One");
    let cfg = AppConfig::from_env().expect("config");
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.site.site_title, "Pick One");
    assert_eq!(cfg.site.site_header, "This or That Admin");

    env::set_var("PORT", "not-a-port");
    assert!(AppConfig::from_env().is_err());
    env::remove_var("PORT");
    env::remove_var("SITE_TITLE");
}
