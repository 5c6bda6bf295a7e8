//! 核心编排层：错误与恢复、降级、意图分派、会话与存档、崩溃恢复、关闭、主控循环

pub mod autosave;
pub mod builder;
pub mod crash;
pub mod degradation;
pub mod error;
pub mod intent;
pub mod orchestrator;
pub mod recovery;
pub mod session;
pub mod shutdown;
pub mod state;

pub use autosave::{AutoSaveManager, Checkpoint};
pub use builder::{create_llm_from_config, default_registry, load_module_sections, OrchestratorBuilder};
pub use crash::{CrashRecoveryManager, SessionRecovery};
pub use degradation::{DegradationLevel, DegradationManager};
pub use error::{DmError, DmResult};
pub use intent::{classify_intent, AgentPlan, PlayerIntent, SystemCommand};
pub use orchestrator::{spawn_session_loop, Command, Orchestrator, OrchestratorResponse, RecoveryNote};
pub use recovery::{AgentRecoveryManager, RecoveryResult, RecoveryStrategy};
pub use session::{
    GameSession, InMemorySessionSerializer, JsonFileSessionSerializer, SaveMode, SessionSerializer,
    SessionSnapshot, SharedSession,
};
pub use shutdown::{
    run_with_graceful_shutdown, AutoSaveCleanup, CleanupOutcome, CrashMarkerCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
pub use state::{TurnPhase, TurnState};
