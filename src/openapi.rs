use crate::models::{AuthResponse, LoginRequest, RegisterRequest, SymbolMatch, UserResponse};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::register,
        crate::routes::login,
        crate::routes::current_user,
        crate::routes::get_quotes,
        crate::routes::search_symbols,
    ),
    components(schemas(
        RegisterRequest, LoginRequest, UserResponse, AuthResponse, SymbolMatch
    )),
    tags(
        (name = "auth", description = "Registration, login and current-user lookup"),
        (name = "quotes", description = "Cached stock quote proxy and symbol search"),
    )
)]
pub struct ApiDoc;
