//! Well-known task types, channels and event names.

#![allow(missing_docs)]

/// Message types carried by the message queues.
pub mod tasks {
    pub const USER_REGISTER: &str = "user.register";
    pub const USER_LOGIN: &str = "user.login";
    pub const USER_PROFILE_UPDATE: &str = "user.profile_update";
    pub const USER_STATUS_CHANGE: &str = "user.status_change";

    pub const MEETING_CREATE: &str = "meeting.create";
    pub const MEETING_END: &str = "meeting.end";
    pub const MEETING_RECORDING_PROCESS: &str = "meeting.recording_process";

    pub const MEDIA_TRANSCODE: &str = "media.transcode";
    pub const MEDIA_UPLOAD_TO_STORAGE: &str = "media.upload_to_minio";

    pub const AI_SPEECH_RECOGNITION: &str = "ai.speech_recognition";
    pub const AI_EMOTION_DETECTION: &str = "ai.emotion_detection";
    pub const AI_DEEPFAKE_DETECTION: &str = "ai.deepfake_detection";
}

/// Pub/sub channel names.
pub mod channels {
    pub const USER_EVENTS: &str = "user_events";
    pub const MEETING_EVENTS: &str = "meeting_events";
    pub const MEDIA_EVENTS: &str = "media_events";
    pub const AI_EVENTS: &str = "ai_events";
    pub const SIGNALING_EVENTS: &str = "signaling_events";
    /// Target of `QueueManager::publish_system_event`.
    pub const SYSTEM_EVENTS: &str = "system_events";
}

/// Event types published on the channels.
pub mod events {
    pub const MEETING_CREATED: &str = "meeting.created";
    pub const MEETING_STARTED: &str = "meeting.started";
    pub const MEETING_ENDED: &str = "meeting.ended";
    pub const USER_JOINED: &str = "meeting.user_joined";
    pub const USER_LEFT: &str = "meeting.user_left";

    pub const RECORDING_STARTED: &str = "recording.started";
    pub const RECORDING_STOPPED: &str = "recording.stopped";
    pub const RECORDING_PROCESSED: &str = "recording.processed";
    pub const TRANSCODE_COMPLETED: &str = "transcode.completed";

    pub const SPEECH_RECOGNITION_COMPLETED: &str = "speech_recognition.completed";
    pub const EMOTION_DETECTION_COMPLETED: &str = "emotion_detection.completed";
    pub const DEEPFAKE_DETECTION_COMPLETED: &str = "deepfake_detection.completed";
}
