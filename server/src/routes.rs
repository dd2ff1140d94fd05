use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pi_rover_common::motor::{Direction, MotorDriver, Speed};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::access::{self, AllowedNetwork};
use crate::context::AppContext;
use crate::qr::{self, QrCode};
use crate::stream;

const INDEX_HTML: &str = include_str!("../assets/index.html");

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Failure reported to the page as `{"success": false, "error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

#[derive(Debug, Deserialize)]
struct MotorCommand {
    #[serde(default)]
    command: String,
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SpeedUpdate {
    speed: Option<f64>,
}

#[derive(Debug, Serialize)]
struct MotorControlResponse {
    success: bool,
    status: String,
}

#[derive(Debug, Serialize)]
struct SpeedResponse {
    success: bool,
    speed: u8,
}

#[derive(Debug, Serialize)]
struct ScanResponse {
    success: bool,
    count: usize,
    qr_codes: Vec<QrCode>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    camera: String,
    motors: String,
    qr: bool,
}

fn describe(direction: Direction, speed: Speed) -> String {
    match direction {
        Direction::Forward => format!("Moving forward at {speed}"),
        Direction::Backward => format!("Moving backward at {speed}"),
        Direction::Left => format!("Turning left at {speed}"),
        Direction::Right => format!("Turning right at {speed}"),
        Direction::Stop => "Motors stopped".to_string(),
    }
}

/// State of the motor routes, which are only mounted when a driver is fitted.
#[derive(Clone)]
struct MotorRoutes {
    ctx: Arc<AppContext>,
    driver: Arc<dyn MotorDriver>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// POST /motor_control
/// Body: { "command": "forward", "speed": 80 }
async fn motor_control(
    State(MotorRoutes { ctx, driver }): State<MotorRoutes>,
    body: Result<Json<MotorCommand>, JsonRejection>,
) -> Result<Json<MotorControlResponse>, ApiError> {
    let Json(body) = body?;

    let direction: Direction = body
        .command
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid command"))?;
    let speed = body
        .speed
        .map(Speed::clamped)
        .unwrap_or_else(|| ctx.default_speed());

    info!(command = ?direction, %speed, "motor command");

    let result = tokio::task::spawn_blocking(move || driver.drive(direction, speed)).await;
    match result {
        Ok(Ok(())) => Ok(Json(MotorControlResponse {
            success: true,
            status: describe(direction, speed),
        })),
        Ok(Err(e)) => {
            error!(error = %e, "motor command failed");
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// POST /motor_speed: sets the speed for commands that omit one.
async fn motor_speed(
    State(MotorRoutes { ctx, .. }): State<MotorRoutes>,
    body: Result<Json<SpeedUpdate>, JsonRejection>,
) -> Result<Json<SpeedResponse>, ApiError> {
    let Json(body) = body?;
    let speed = body
        .speed
        .map(Speed::clamped)
        .unwrap_or_else(|| ctx.default_speed());
    ctx.set_default_speed(speed);
    info!(%speed, "speed updated");
    Ok(Json(SpeedResponse {
        success: true,
        speed: speed.percent(),
    }))
}

/// GET /scan_qr: decode QR codes in the newest camera frame.
async fn scan_qr(State(ctx): State<Arc<AppContext>>) -> Result<Json<ScanResponse>, ApiError> {
    let frame = ctx.relay.latest().ok_or_else(|| {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "No camera frame available yet")
    })?;
    debug!(seq = frame.seq, age_ms = frame.age_ms(), "scanning frame for QR codes");

    let result = tokio::task::spawn_blocking(move || qr::scan_image(&frame.data)).await;
    match result {
        Ok(Ok(qr_codes)) => {
            for code in &qr_codes {
                info!(data = code.data, "QR code detected");
            }
            Ok(Json(ScanResponse {
                success: true,
                count: qr_codes.len(),
                qr_codes,
            }))
        }
        Ok(Err(e)) => {
            error!(error = %e, "QR scan failed");
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// GET /status: health check and feature discovery for the page.
async fn status(State(ctx): State<Arc<AppContext>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running",
        camera: ctx.camera_model.clone(),
        motors: ctx
            .motors
            .as_ref()
            .map(|m| m.name().to_string())
            .unwrap_or_else(|| "disabled".to_string()),
        qr: ctx.qr_enabled,
    })
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(ctx: Arc<AppContext>, allowed: AllowedNetwork) -> Router {
    let mut app = Router::new()
        .route("/", get(index))
        .route("/video_feed", get(stream::video_feed))
        .route("/status", get(status));

    if let Some(driver) = ctx.motors.clone() {
        let motor_routes: Router<Arc<AppContext>> = Router::new()
            .route("/motor_control", post(motor_control))
            .route("/motor_speed", post(motor_speed))
            .with_state(MotorRoutes {
                ctx: Arc::clone(&ctx),
                driver,
            });
        app = app.merge(motor_routes);
    }
    if ctx.qr_enabled {
        app = app.route("/scan_qr", get(scan_qr));
    }

    app.with_state(ctx)
        .layer(middleware::from_fn_with_state(
            Arc::new(allowed),
            access::restrict_remote_addr,
        ))
        .layer(TraceLayer::new_for_http())
}
