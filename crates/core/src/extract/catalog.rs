//! Catalog of known payload fields
//!
//! Every key the capture script may send is declared here with its type and
//! the value a missing key defaults to. Keys are matched exactly; anything
//! not listed (and not carrying the client-parameter prefix) is ignored.

use beacon_schemas::{FieldKind, FieldValue};

/// Value a field takes when its key is absent from the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDefault {
    Null,
    False,
    Zero,
}

impl FieldDefault {
    pub fn value(&self) -> FieldValue {
        match self {
            Self::Null => FieldValue::Null,
            Self::False => FieldValue::Bool(false),
            Self::Zero => FieldValue::Int(0),
        }
    }
}

/// Declaration of one payload field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub key: &'static str,
    pub kind: FieldKind,
    pub default: FieldDefault,
}

impl FieldSpec {
    const fn new(key: &'static str, kind: FieldKind) -> Self {
        Self {
            key,
            kind,
            default: FieldDefault::Null,
        }
    }

    const fn or_false(mut self) -> Self {
        self.default = FieldDefault::False;
        self
    }

    const fn or_zero(mut self) -> Self {
        self.default = FieldDefault::Zero;
        self
    }
}

const fn int(key: &'static str) -> FieldSpec {
    FieldSpec::new(key, FieldKind::Int)
}

const fn flag(key: &'static str) -> FieldSpec {
    FieldSpec::new(key, FieldKind::Bool)
}

const fn dec(key: &'static str) -> FieldSpec {
    FieldSpec::new(key, FieldKind::Decimal)
}

const fn ts(key: &'static str) -> FieldSpec {
    FieldSpec::new(key, FieldKind::Timestamp)
}

const fn text(key: &'static str) -> FieldSpec {
    FieldSpec::new(key, FieldKind::Text)
}

/// Fingerprint inputs, in hashing order
pub const CANVAS_HASH: &str = "canvas_hash";
pub const FONT_LIST: &str = "font_list";
pub const WEBGL_RENDERER: &str = "webgl_renderer";
pub const WEBGL_SIGNATURE: &str = "webgl_signature";
pub const AUDIO_HASH: &str = "audio_hash";

pub static FIELD_CATALOG: &[FieldSpec] = &[
    // Screen geometry
    int("screen_width"),
    int("screen_height"),
    int("screen_avail_width"),
    int("screen_avail_height"),
    int("screen_avail_left"),
    int("screen_avail_top"),
    int("color_depth"),
    int("pixel_depth"),
    dec("device_pixel_ratio"),
    int("inner_width"),
    int("inner_height"),
    int("outer_width"),
    int("outer_height"),
    text("screen_orientation"),
    int("orientation_angle"),
    flag("screen_is_extended").or_false(),
    dec("visual_viewport_width"),
    dec("visual_viewport_height"),
    dec("visual_viewport_scale"),
    text("color_gamut"),
    // Locale
    text("language"),
    text("languages"),
    text("timezone"),
    int("timezone_offset"),
    text("locale_calendar"),
    text("locale_numbering"),
    text("date_format"),
    text("number_format"),
    text("currency_hint"),
    text("text_direction"),
    text("hour_cycle"),
    int("first_day_of_week"),
    // User agent and client hints
    text("user_agent"),
    text("app_version"),
    text("app_name"),
    text("app_code_name"),
    text("product"),
    text("product_sub"),
    text("vendor"),
    text("vendor_sub"),
    text("platform"),
    text("oscpu"),
    text("build_id"),
    text("ch_brands"),
    text("ch_full_version_list"),
    text("ch_platform"),
    text("ch_platform_version"),
    text("ch_architecture"),
    text("ch_bitness"),
    text("ch_model"),
    flag("ch_mobile"),
    flag("ch_wow64"),
    text("ch_form_factors"),
    text("ch_ua_full_version"),
    // Capability flags
    flag("cookies_enabled"),
    text("do_not_track"),
    flag("global_privacy_control").or_false(),
    flag("local_storage").or_false(),
    flag("session_storage").or_false(),
    flag("indexed_db").or_false(),
    flag("open_database").or_false(),
    flag("service_worker").or_false(),
    flag("web_worker").or_false(),
    flag("shared_worker").or_false(),
    flag("webassembly").or_false(),
    flag("webrtc").or_false(),
    flag("websocket").or_false(),
    flag("web_bluetooth").or_false(),
    flag("web_usb").or_false(),
    flag("web_serial").or_false(),
    flag("web_hid").or_false(),
    flag("web_midi").or_false(),
    flag("web_share").or_false(),
    flag("clipboard_api").or_false(),
    flag("notifications").or_false(),
    flag("push_manager").or_false(),
    flag("payment_request").or_false(),
    flag("credential_manager").or_false(),
    flag("geolocation_api").or_false(),
    flag("battery_api").or_false(),
    flag("gamepad_api").or_false(),
    flag("speech_synthesis").or_false(),
    flag("speech_recognition").or_false(),
    flag("media_devices").or_false(),
    flag("pdf_viewer_enabled").or_false(),
    flag("java_enabled").or_false(),
    flag("touch_support").or_false(),
    int("max_touch_points").or_zero(),
    int("hardware_concurrency"),
    dec("device_memory"),
    flag("pointer_fine"),
    flag("hover_capable"),
    flag("prefers_reduced_motion"),
    text("prefers_color_scheme"),
    flag("forced_colors"),
    flag("inverted_colors"),
    int("plugins_count").or_zero(),
    int("mime_types_count").or_zero(),
    flag("webdriver").or_false(),
    int("headless_hints").or_zero(),
    // Graphics, audio and high-entropy signatures
    text(CANVAS_HASH),
    text(FONT_LIST),
    text(WEBGL_RENDERER),
    text("webgl_vendor"),
    text(WEBGL_SIGNATURE),
    text("webgl_version"),
    int("webgl_max_texture_size"),
    int("webgl_extensions_count"),
    flag("webgpu_supported").or_false(),
    text("webgpu_adapter"),
    text(AUDIO_HASH),
    int("audio_sample_rate"),
    int("audio_channel_count"),
    dec("audio_base_latency"),
    text("math_fingerprint"),
    text("emoji_hash"),
    text("speech_voices_hash"),
    // Network information
    text("connection_type"),
    text("effective_type"),
    dec("downlink"),
    int("rtt"),
    flag("save_data"),
    int("webrtc_local_ip_count"),
    // Timing
    ts("nav_start"),
    ts("client_timestamp"),
    int("page_load_ms"),
    int("dom_interactive_ms"),
    int("dom_content_loaded_ms"),
    int("dom_complete_ms"),
    int("first_paint_ms"),
    int("first_contentful_paint_ms"),
    int("largest_contentful_paint_ms"),
    int("time_to_first_byte_ms"),
    int("dns_lookup_ms"),
    int("tcp_connect_ms"),
    int("tls_handshake_ms"),
    int("request_ms"),
    int("response_ms"),
    int("redirect_count"),
    text("navigation_type"),
    int("transfer_size"),
    dec("cumulative_layout_shift"),
    int("first_input_delay_ms"),
    int("interaction_to_next_paint_ms"),
    // Behavioral signals
    int("mouse_moves").or_zero(),
    int("mouse_clicks").or_zero(),
    int("mouse_distance_px").or_zero(),
    int("scroll_events").or_zero(),
    dec("scroll_depth_pct"),
    int("max_scroll_y"),
    int("key_presses").or_zero(),
    dec("key_interval_avg_ms"),
    int("touch_events").or_zero(),
    int("focus_changes").or_zero(),
    int("visibility_changes").or_zero(),
    int("time_on_page_ms"),
    int("idle_ms"),
    int("copy_events").or_zero(),
    int("paste_events").or_zero(),
    int("form_interactions").or_zero(),
    int("first_interaction_ms"),
    int("tab_hidden_ms"),
    // Page context
    text("page_url"),
    text("page_path"),
    text("page_title"),
    text("referrer"),
    text("referrer_domain"),
    int("history_length"),
    text("utm_source"),
    text("utm_medium"),
    text("utm_campaign"),
    text("utm_term"),
    text("utm_content"),
    text("gclid"),
    text("fbclid"),
    text("msclkid"),
    text("landing_page"),
    text("page_hash"),
    text("document_charset"),
    text("document_ready_state"),
    int("iframe_depth").or_zero(),
    flag("in_iframe").or_false(),
    // Client session
    text("client_id"),
    text("session_id"),
    int("session_seq"),
    flag("is_first_visit"),
    text("script_version"),
    int("beacon_seq"),
    text("consent_state"),
    text("tracker_id"),
];

/// Look up a field declaration by key
pub fn field_spec(key: &str) -> Option<&'static FieldSpec> {
    FIELD_CATALOG.iter().find(|spec| spec.key == key)
}
