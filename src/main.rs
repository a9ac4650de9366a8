use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;

use voice_pipeline::config::Config;
use voice_pipeline::sink::{track_channel, SpeakerSink};
use voice_pipeline::{AudioRouter, Destination, OutputEvent};

/// 上游每条消息的时长，模拟语音服务的下发节奏
const FEED_INTERVAL_MS: u32 = 20;

/// end_stream 之后等待各输出排空的最长时间
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn usage() -> ! {
    eprintln!("usage: voice-pipeline [config.toml] <input-file>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    env_logger::init();

    // 解析参数: 可选的配置文件 + 输入音频文件
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, input_path) = match args.as_slice() {
        [input] => (None, PathBuf::from(input)),
        [config, input] => (Some(PathBuf::from(config)), PathBuf::from(input)),
        _ => usage(),
    };

    // 加载配置
    let config = Config::load(config_path.as_deref())?;
    let source_format = config.source.format()?;
    let declared = config.source.encoding.declared();

    let input = std::fs::read(&input_path)
        .with_context(|| format!("Failed to read input file {}", input_path.display()))?;
    log::info!(
        "Input: {} ({} bytes), source {:?} {}",
        input_path.display(),
        input.len(),
        config.source.encoding,
        source_format
    );

    let (mut router, mut events) =
        AudioRouter::with_events(Some(source_format), config.decoder.block_ms);

    // 本地扬声器输出
    if config.speaker.enabled {
        let speaker = config.speaker.clone();
        let format = speaker.format()?;
        router.add_destination(
            "speaker",
            Box::new(move || {
                let sink = SpeakerSink::open(&speaker.device, format, speaker.period_size())?;
                Ok(Box::new(sink) as Box<dyn Destination>)
            }),
        )?;
    }

    // 网络音轨输出，本地任务代替远端 peer 消费帧
    let mut track = None;
    if config.track.enabled {
        let (handle, mut receiver) = track_channel(config.track.queue_frames, config.track.frame_ms);
        let sink_handle = handle.clone();
        router.add_destination(
            "track",
            Box::new(move || Ok(Box::new(sink_handle.sink()) as Box<dyn Destination>)),
        )?;
        let consumer = tokio::spawn(async move {
            let (mut audio, mut silence) = (0u64, 0u64);
            while let Some(frame) = receiver.recv().await {
                if frame.silence {
                    silence += 1;
                } else {
                    audio += 1;
                }
            }
            (audio, silence)
        });
        track = Some((handle, consumer));
    }

    let destinations = router.destinations().len();
    if destinations == 0 {
        anyhow::bail!("No output enabled (check [speaker]/[track] or OUTPUT_MODE)");
    }

    // 按固定节奏把文件切块送入路由
    let chunk_bytes = (source_format.frames_for_ms(FEED_INTERVAL_MS) * source_format.bytes_per_frame()).max(1);
    let mut ticker = tokio::time::interval(Duration::from_millis(FEED_INTERVAL_MS as u64));
    let mut interrupted = false;
    for piece in input.chunks(chunk_bytes) {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                interrupted = true;
                break;
            }
            _ = ticker.tick() => {
                router.feed_chunk(None, declared, piece.to_vec());
            }
        }
    }

    if !interrupted {
        router.end_stream();

        // 等待每个输出报告排空或失败
        let mut finished = 0;
        let wait = async {
            while let Some(event) = events.recv().await {
                match event {
                    OutputEvent::Started { destination, stages, .. } => {
                        log::info!("{}: {}", destination, stages.join(" -> "));
                    }
                    OutputEvent::Drained { destination, stats, .. } => {
                        log::info!("{} drained: {}", destination, stats);
                        finished += 1;
                    }
                    OutputEvent::Failed { destination, error, .. } => {
                        log::error!("{} failed: {}", destination, error);
                        finished += 1;
                    }
                }
                if finished == destinations {
                    break;
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, wait).await.is_err() {
            log::warn!("Timed out waiting for outputs to drain");
        }
    }

    // 停止输出线程（join 会阻塞，放到阻塞线程池）
    tokio::task::spawn_blocking(move || router.shutdown())
        .await
        .context("Output workers did not stop cleanly")?;

    if let Some((handle, consumer)) = track {
        handle.close();
        let (audio, silence) = consumer.await.context("Track consumer failed")?;
        log::info!(
            "Track: {} audio frames, {} silence frames, {} dropped",
            audio,
            silence,
            handle.dropped_frames()
        );
    }

    Ok(())
}
