//! Voter identity: a registered user (JWT subject) or an anonymous session.
//!
//! Anonymous sessions live in the `tot_session` cookie. [`Identity`] issues a
//! fresh token when a request has none; [`SessionCookies`] then writes it to
//! a successful response.

use actix_web::cookie::{Cookie, SameSite};
use actix_web::dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{http::header, Error, FromRequest, HttpMessage, HttpRequest};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;

use crate::auth::Auth;

pub const SESSION_COOKIE: &str = "tot_session";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(String),
    AnonymousSession(String),
}

impl Identity {
    /// Single lookup key used for the one-vote-per-question constraint.
    pub fn key(&self) -> String {
        match self {
            Identity::User(sub) => format!("user:{sub}"),
            Identity::AnonymousSession(token) => format!("session:{token}"),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::User(sub) => Some(sub),
            Identity::AnonymousSession(_) => None,
        }
    }

    pub fn session_key(&self) -> Option<&str> {
        match self {
            Identity::User(_) => None,
            Identity::AnonymousSession(token) => Some(token),
        }
    }
}

/// Marker left in request extensions when a session token was minted.
#[derive(Debug, Clone)]
struct IssuedSession(String);

fn new_session_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// `None` when no Authorization header is present, otherwise the verified user.
fn bearer_identity(req: &HttpRequest) -> Option<Result<Identity, Error>> {
    if !req.headers().contains_key(header::AUTHORIZATION) {
        return None;
    }
    let mut pl = Payload::None;
    Some(
        Auth::from_request(req, &mut pl)
            .into_inner()
            .map(|auth| Identity::User(auth.0.sub)),
    )
}

fn session_identity(req: &HttpRequest) -> Option<Identity> {
    if let Some(issued) = req.extensions().get::<IssuedSession>() {
        return Some(Identity::AnonymousSession(issued.0.clone()));
    }
    req.cookie(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .map(Identity::AnonymousSession)
}

/// Extractor that always yields an identity, minting an anonymous session if needed.
impl FromRequest for Identity {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, _pl: &mut Payload) -> Self::Future {
        if let Some(res) = bearer_identity(req) {
            return ready(res);
        }
        if let Some(id) = session_identity(req) {
            return ready(Ok(id));
        }
        let token = new_session_token();
        req.extensions_mut().insert(IssuedSession(token.clone()));
        ready(Ok(Identity::AnonymousSession(token)))
    }
}

/// Extractor for read-only views: the caller's identity if one is already established.
pub struct KnownIdentity(pub Option<Identity>);

impl FromRequest for KnownIdentity {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, _pl: &mut Payload) -> Self::Future {
        match bearer_identity(req) {
            Some(Ok(id)) => ready(Ok(KnownIdentity(Some(id)))),
            Some(Err(e)) => ready(Err(e)),
            None => ready(Ok(KnownIdentity(session_identity(req)))),
        }
    }
}

/// Middleware writing the anonymous session cookie for freshly minted tokens on 2xx responses.
#[derive(Clone, Default)]
pub struct SessionCookies {
    pub secure: bool,
}

impl SessionCookies {
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for SessionCookies
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = SessionCookiesMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SessionCookiesMiddleware {
            service: Rc::new(service),
            cfg: self.clone(),
        }))
    }
}

pub struct SessionCookiesMiddleware<S> {
    service: Rc<S>,
    cfg: SessionCookies,
}

impl<S, B> Service<ServiceRequest> for SessionCookiesMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &self,
        ctx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = self.service.clone();
        let secure = self.cfg.secure;
        Box::pin(async move {
            let mut res = svc.call(req).await?;
            // a rejected request keeps the caller cookieless
            if !res.status().is_success() {
                return Ok(res);
            }
            let issued = res.request().extensions().get::<IssuedSession>().cloned();
            if let Some(IssuedSession(token)) = issued {
                let cookie = Cookie::build(SESSION_COOKIE, token)
                    .path("/")
                    .http_only(true)
                    .same_site(SameSite::Lax)
                    .secure(secure)
                    .finish();
                if let Err(e) = res.response_mut().add_cookie(&cookie) {
                    log::warn!("failed to set session cookie: {e}");
                }
            }
            Ok(res)
        })
    }
}
