use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrafficError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid configuration value for {field}: '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed for {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Failed to connect to simulation: {message}")]
    ConnectionError { message: String },

    #[error("TraCI protocol error: {message}")]
    ProtocolError { message: String },

    #[error("TraCI command 0x{command:02x} failed: {description}")]
    CommandFailed { command: u8, description: String },

    #[error("Simulation error: {message}")]
    SimulationError { message: String },

    #[error("No traffic lights found in the network")]
    NoTrafficLights,

    #[error("Unknown {kind}: {id}")]
    UnknownObject { kind: String, id: String },

    #[error("Q-table file not found: {path}")]
    QTableNotFound { path: String },

    #[error("Q-table '{table}' does not match the network: {message}")]
    QTableMismatch { table: String, message: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Simulation,
    Protocol,
    Storage,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl TrafficError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TrafficError::TomlError(_)
            | TrafficError::ConfigError { .. }
            | TrafficError::MissingConfigError { .. }
            | TrafficError::InvalidConfigValueError { .. }
            | TrafficError::ConfigValidationError { .. } => ErrorCategory::Configuration,
            TrafficError::ConnectionError { .. }
            | TrafficError::ProtocolError { .. }
            | TrafficError::CommandFailed { .. } => ErrorCategory::Protocol,
            TrafficError::SimulationError { .. }
            | TrafficError::NoTrafficLights
            | TrafficError::UnknownObject { .. } => ErrorCategory::Simulation,
            TrafficError::IoError(_)
            | TrafficError::QTableNotFound { .. }
            | TrafficError::QTableMismatch { .. } => ErrorCategory::Storage,
            TrafficError::CsvError(_)
            | TrafficError::SerializationError(_)
            | TrafficError::ProcessingError { .. }
            | TrafficError::ValidationError { .. } => ErrorCategory::Data,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TrafficError::ValidationError { .. } => ErrorSeverity::Low,
            // 連線中斷通常重啟 SUMO 後即可重試
            TrafficError::ConnectionError { .. } | TrafficError::CommandFailed { .. } => {
                ErrorSeverity::Medium
            }
            TrafficError::IoError(_) | TrafficError::ProtocolError { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::High,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Configuration => {
                "Check the TOML configuration file and command line overrides"
            }
            ErrorCategory::Protocol => {
                "Make sure SUMO is installed, the binary is on PATH and the TraCI port is free"
            }
            ErrorCategory::Simulation => {
                "Check that the network and route files define traffic lights and vehicles"
            }
            ErrorCategory::Storage => match self {
                TrafficError::QTableNotFound { .. } => {
                    "Run the `train` command first or point --q-table at an existing file"
                }
                TrafficError::QTableMismatch { .. } => {
                    "Retrain with --fresh, the Q-table was created for a different network"
                }
                _ => "Check that the output directory exists and is writable",
            },
            ErrorCategory::Data => "Check the input data files for malformed rows",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Protocol => format!("Could not talk to the simulator: {}", self),
            ErrorCategory::Simulation => format!("Simulation problem: {}", self),
            ErrorCategory::Storage => format!("File problem: {}", self),
            ErrorCategory::Data => format!("Data problem: {}", self),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        TrafficError::ProtocolError {
            message: message.into(),
        }
    }

    pub fn simulation(message: impl Into<String>) -> Self {
        TrafficError::SimulationError {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrafficError>;
